//! Shared fixtures for hostlink integration tests

#![allow(dead_code)]

use hostlink::{HostConfig, RetryPolicy, SessionFactory};
use hostlink::ssh::MockTransport;
use std::sync::Arc;
use std::time::Duration;

pub const SSH_CONFIG: &str = "\
Host h1
  HostName 192.168.10.1
  User deploy

Host h2
  HostName 192.168.10.2
  User deploy
  Port 2222
  IdentityFile ~/.ssh/id_deploy

Host *
  ServerAliveInterval 30
";

/// Factory resolving `h1`/`h2` and connecting through `transport`
pub fn factory_builder(transport: &MockTransport, max_attempts: u32) -> SessionFactory {
    let policy = RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_fixed_delay(Duration::ZERO);

    SessionFactory::new()
        .with_hosts(HostConfig::parse(SSH_CONFIG))
        .with_remote_transport(Arc::new(transport.clone()))
        .with_retry_policy(policy)
}

pub fn mock_factory(transport: &MockTransport, max_attempts: u32) -> Arc<SessionFactory> {
    Arc::new(factory_builder(transport, max_attempts))
}
