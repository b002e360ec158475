use std::marker::PhantomData;

use anyhow::bail;
use tracing::trace;

use crate::endpoint::service_endpoint::{EndpointType, ServiceEndpoint};
use crate::error::ServiceTransportError;
use crate::protocol::messages::{MessageTarget, ServiceMessage};
use crate::util::random::{random_index, Random, RngRandom};

/// Decides which endpoints clients are negotiated to, and which endpoints outbound messages are
///  sent to. Messages go to all endpoints unless a router knows better.
pub trait EndpointRouter: Send + Sync + 'static {
    fn get_negotiate_endpoint(&self, endpoints: &[ServiceEndpoint]) -> anyhow::Result<ServiceEndpoint>;

    fn get_endpoints_for_broadcast(&self, endpoints: &[ServiceEndpoint]) -> Vec<ServiceEndpoint> {
        endpoints.to_vec()
    }

    fn get_endpoints_for_user(&self, _user_id: &str, endpoints: &[ServiceEndpoint]) -> Vec<ServiceEndpoint> {
        endpoints.to_vec()
    }

    fn get_endpoints_for_users(&self, _user_ids: &[String], endpoints: &[ServiceEndpoint]) -> Vec<ServiceEndpoint> {
        endpoints.to_vec()
    }

    fn get_endpoints_for_group(&self, _group: &str, endpoints: &[ServiceEndpoint]) -> Vec<ServiceEndpoint> {
        endpoints.to_vec()
    }

    fn get_endpoints_for_groups(&self, _groups: &[String], endpoints: &[ServiceEndpoint]) -> Vec<ServiceEndpoint> {
        endpoints.to_vec()
    }

    fn get_endpoints_for_connection(&self, _connection_id: &str, endpoints: &[ServiceEndpoint]) -> Vec<ServiceEndpoint> {
        endpoints.to_vec()
    }
}

/// The endpoints a message is sent to, based on its addressing
pub fn endpoints_for_message(router: &dyn EndpointRouter, msg: &ServiceMessage, endpoints: &[ServiceEndpoint]) -> Vec<ServiceEndpoint> {
    match msg.target() {
        MessageTarget::Broadcast | MessageTarget::Control => router.get_endpoints_for_broadcast(endpoints),
        MessageTarget::User(user_id) => router.get_endpoints_for_user(user_id, endpoints),
        MessageTarget::Users(user_ids) => router.get_endpoints_for_users(user_ids, endpoints),
        MessageTarget::Group(group) => router.get_endpoints_for_group(group, endpoints),
        MessageTarget::Groups(groups) => router.get_endpoints_for_groups(groups, endpoints),
        MessageTarget::Connection(connection_id) => router.get_endpoints_for_connection(connection_id, endpoints),
        MessageTarget::Connections(connection_ids) => {
            let mut result: Vec<ServiceEndpoint> = Vec::new();
            for connection_id in connection_ids {
                for endpoint in router.get_endpoints_for_connection(connection_id, endpoints) {
                    if !result.contains(&endpoint) {
                        result.push(endpoint);
                    }
                }
            }
            result
        }
    }
}

/// Online primary endpoints if there are any, online secondary endpoints otherwise
pub fn negotiate_candidates(endpoints: &[ServiceEndpoint]) -> anyhow::Result<Vec<&ServiceEndpoint>> {
    for endpoint_type in [EndpointType::Primary, EndpointType::Secondary] {
        let candidates = endpoints.iter()
            .filter(|e| e.endpoint_type() == endpoint_type && e.is_online())
            .collect::<Vec<_>>();
        if !candidates.is_empty() {
            trace!("negotiation candidates: {:?}", candidates);
            return Ok(candidates);
        }
    }
    bail!(ServiceTransportError::ServiceNotConnected)
}

/// Negotiates clients to a uniformly random eligible endpoint
pub struct DefaultEndpointRouter<R: Random = RngRandom> {
    _random: PhantomData<fn() -> R>,
}

impl DefaultEndpointRouter {
    pub fn new() -> DefaultEndpointRouter {
        Self::new_with_random()
    }
}

impl Default for DefaultEndpointRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Random> DefaultEndpointRouter<R> {
    pub fn new_with_random() -> DefaultEndpointRouter<R> {
        DefaultEndpointRouter {
            _random: Default::default(),
        }
    }
}

impl<R: Random + 'static> EndpointRouter for DefaultEndpointRouter<R> {
    fn get_negotiate_endpoint(&self, endpoints: &[ServiceEndpoint]) -> anyhow::Result<ServiceEndpoint> {
        let candidates = negotiate_candidates(endpoints)?;
        let Some(idx) = random_index::<R>(candidates.len()) else {
            bail!(ServiceTransportError::ServiceNotConnected);
        };
        Ok(candidates[idx].clone())
    }
}

/// Negotiates clients to the eligible endpoint that reported the fewest client connections,
///  choosing randomly between endpoints with the same count
pub struct LeastConnectionRouter<R: Random = RngRandom> {
    _random: PhantomData<fn() -> R>,
}

impl LeastConnectionRouter {
    pub fn new() -> LeastConnectionRouter {
        LeastConnectionRouter {
            _random: Default::default(),
        }
    }
}

impl Default for LeastConnectionRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Random + 'static> EndpointRouter for LeastConnectionRouter<R> {
    fn get_negotiate_endpoint(&self, endpoints: &[ServiceEndpoint]) -> anyhow::Result<ServiceEndpoint> {
        let candidates = negotiate_candidates(endpoints)?;

        let min_count = candidates.iter()
            .map(|e| e.metrics().client_connection_count)
            .min()
            .unwrap_or_default();
        let least_loaded = candidates.into_iter()
            .filter(|e| e.metrics().client_connection_count == min_count)
            .collect::<Vec<_>>();

        let Some(idx) = random_index::<R>(least_loaded.len()) else {
            bail!(ServiceTransportError::ServiceNotConnected);
        };
        Ok(least_loaded[idx].clone())
    }
}
