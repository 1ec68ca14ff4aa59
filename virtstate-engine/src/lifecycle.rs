//! Instance state transitions.
//!
//! Start, stop and network-wait share the same shape: short-circuit when the
//! instance is already where it should be, issue the action, await the
//! operation handle, then poll the runtime state until the target is
//! observed. Targets are derived states, not raw status codes: "running" for
//! a guest means the in-guest agent has attached, not just that the outer
//! hypervisor view says Running.

use tracing::{debug, info, instrument};
use virtstate_client::{
    InstanceServer, InstanceState, InstanceStatePut, StateAction, StatusCode,
};
use virtstate_common::Deadline;

use crate::error::{EngineError, Result};
use crate::network::has_global_inet;
use crate::poll::{wait_for_state, PollConfig, PollError};

const STATUS_OPERATIONAL: &[&str] = &["Running", "Ready"];
const STATUS_STOPPED: &[&str] = &["Stopped"];
const STATUS_NETWORK_READY: &[&str] = &["Network ready"];

/// Raw status is Running or Ready, regardless of guest readiness.
pub fn is_instance_running(state: &InstanceState) -> bool {
    matches!(state.status_code, StatusCode::Running | StatusCode::Ready)
}

/// Running with the guest agent attached.
pub fn is_instance_operational(state: &InstanceState) -> bool {
    is_instance_running(state) && state.processes > 0
}

pub fn is_instance_stopped(state: &InstanceState) -> bool {
    state.status_code == StatusCode::Stopped
}

// Status label for the start poll. The intermediate label keeps a VM that
// the hypervisor already reports Running out of the target set until the
// guest agent attaches.
fn start_status(state: &InstanceState) -> String {
    if is_instance_running(state) && !is_instance_operational(state) {
        format!("{} (initializing)", state.status)
    } else {
        state.status.clone()
    }
}

/// Start an instance and wait until it is operational.
///
/// Returns whether a start action was issued: `false` means the instance was
/// already operational and nothing was done.
#[instrument(skip(server, config, deadline))]
pub async fn start_instance(
    server: &dyn InstanceServer,
    name: &str,
    config: &PollConfig,
    deadline: Deadline,
) -> Result<bool> {
    let (state, etag) = server
        .get_instance_state(name)
        .await
        .map_err(|e| EngineError::remote(name, "fetch state of", e))?;
    if is_instance_operational(&state) {
        debug!("Instance already operational");
        return Ok(false);
    }

    info!("Starting instance");
    let req = InstanceStatePut {
        action: StateAction::Start,
        force: false,
        timeout_secs: config.timeout.as_secs() as i64,
    };
    let op = server
        .update_instance_state(name, req, &etag)
        .await
        .map_err(|e| EngineError::remote(name, "start", e))?;
    op.wait_deadline(deadline)
        .await
        .map_err(|e| EngineError::remote(name, "start", e))?;

    wait_for_state(config, deadline, STATUS_OPERATIONAL, || async move {
        let (state, _) = server.get_instance_state(name).await?;
        let status = start_status(&state);
        Ok(((), status))
    })
    .await
    .map_err(|e| classify_poll(name, "Running", e))?;

    info!("Instance operational");
    Ok(true)
}

/// Stop an instance and wait until it is stopped.
///
/// Returns whether the instance still exists: an ephemeral instance is
/// deleted by the server on stop, and its disappearance anywhere along the
/// way is success with `found = false`, never an error.
#[instrument(skip(server, config, deadline))]
pub async fn stop_instance(
    server: &dyn InstanceServer,
    name: &str,
    force: bool,
    config: &PollConfig,
    deadline: Deadline,
) -> Result<bool> {
    let (state, etag) = match server.get_instance_state(name).await {
        Ok(fetched) => fetched,
        Err(e) if e.is_not_found() => return Ok(false),
        Err(e) => return Err(EngineError::remote(name, "fetch state of", e)),
    };
    if is_instance_stopped(&state) {
        debug!("Instance already stopped");
        return Ok(true);
    }

    info!(force, "Stopping instance");
    let req = InstanceStatePut {
        action: StateAction::Stop,
        force,
        timeout_secs: config.timeout.as_secs() as i64,
    };
    let op = match server.update_instance_state(name, req, &etag).await {
        Ok(op) => op,
        Err(e) if e.is_not_found() => return Ok(false),
        Err(e) => return Err(EngineError::remote(name, "stop", e)),
    };
    if let Err(e) = op.wait_deadline(deadline).await {
        if e.is_not_found() {
            return Ok(false);
        }
        return Err(EngineError::remote(name, "stop", e));
    }

    let polled = wait_for_state(config, deadline, STATUS_STOPPED, || async move {
        let (state, _) = server.get_instance_state(name).await?;
        Ok(((), state.status))
    })
    .await;

    match polled {
        Ok(()) => {
            info!("Instance stopped");
            Ok(true)
        }
        Err(PollError::Refresh(e)) if e.is_not_found() => {
            info!("Instance removed on stop");
            Ok(false)
        }
        Err(e) => Err(classify_poll(name, "Stopped", e)),
    }
}

/// Wait until any non-loopback interface reports a global IPv4 address.
///
/// Only meaningful on an instance already known to be running.
#[instrument(skip(server, config, deadline))]
pub async fn wait_instance_network(
    server: &dyn InstanceServer,
    name: &str,
    config: &PollConfig,
    deadline: Deadline,
) -> Result<()> {
    debug!("Waiting for instance network");
    wait_for_state(config, deadline, STATUS_NETWORK_READY, || async move {
        let (state, _) = server.get_instance_state(name).await?;
        let status = if has_global_inet(&state.network) {
            STATUS_NETWORK_READY[0].to_string()
        } else {
            "No address".to_string()
        };
        Ok(((), status))
    })
    .await
    .map_err(|e| classify_poll(name, STATUS_NETWORK_READY[0], e))
}

fn classify_poll(name: &str, target: &str, err: PollError) -> EngineError {
    match err {
        PollError::Timeout => EngineError::PollTimeout {
            instance: name.to_string(),
            target: target.to_string(),
        },
        PollError::Cancelled => EngineError::Cancelled {
            instance: name.to_string(),
        },
        PollError::Refresh(e) => {
            EngineError::remote(name, &format!("poll for {target:?} on"), e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use virtstate_client::{
        AddressFamily, AddressScope, InstancePut, InstanceSource, InstanceStateNetwork,
        InstanceType, InstancesPost, MockServer, NetworkAddress,
    };

    fn fast_config() -> PollConfig {
        PollConfig {
            delay: Duration::from_millis(1),
            min_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(4),
            timeout: Duration::from_millis(500),
        }
    }

    async fn create(server: &MockServer, name: &str, ephemeral: bool) {
        let req = InstancesPost {
            name: name.to_string(),
            type_: InstanceType::Container,
            source: InstanceSource {
                type_: "none".to_string(),
                ..Default::default()
            },
            put: InstancePut {
                ephemeral,
                ..Default::default()
            },
        };
        server.create_instance(req).await.unwrap().wait().await.unwrap();
    }

    #[test]
    fn test_operational_needs_processes() {
        let mut state = InstanceState {
            status: "Running".to_string(),
            status_code: StatusCode::Running,
            processes: 0,
            ..Default::default()
        };
        assert!(is_instance_running(&state));
        assert!(!is_instance_operational(&state));

        state.processes = 12;
        assert!(is_instance_operational(&state));

        state.status_code = StatusCode::Ready;
        assert!(is_instance_operational(&state));

        state.status_code = StatusCode::Stopped;
        assert!(!is_instance_running(&state));
        assert!(is_instance_stopped(&state));
    }

    #[tokio::test]
    async fn test_start_waits_for_agent() {
        let server = MockServer::new();
        create(&server, "vm1", false).await;
        server.set_agent_delay("vm1", 3);

        start_instance(&server, "vm1", &fast_config(), Deadline::none())
            .await
            .unwrap();

        let (state, _) = server.get_instance_state("vm1").await.unwrap();
        assert!(is_instance_operational(&state));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let server = MockServer::new();
        create(&server, "c1", false).await;

        let started = start_instance(&server, "c1", &fast_config(), Deadline::none())
            .await
            .unwrap();
        assert!(started);
        let started = start_instance(&server, "c1", &fast_config(), Deadline::none())
            .await
            .unwrap();
        assert!(!started);
    }

    #[tokio::test]
    async fn test_stop_on_stopped_instance_is_a_noop() {
        let server = MockServer::new();
        create(&server, "c1", false).await;

        let found = stop_instance(&server, "c1", false, &fast_config(), Deadline::none())
            .await
            .unwrap();
        assert!(found);
    }

    #[tokio::test]
    async fn test_stop_ephemeral_reports_not_found_as_success() {
        let server = MockServer::new();
        create(&server, "eph1", true).await;
        start_instance(&server, "eph1", &fast_config(), Deadline::none())
            .await
            .unwrap();

        let found = stop_instance(&server, "eph1", true, &fast_config(), Deadline::none())
            .await
            .unwrap();
        assert!(!found);
        assert!(!server.has_instance("eph1"));
    }

    #[tokio::test]
    async fn test_stop_missing_instance_is_success_without_found() {
        let server = MockServer::new();
        let found = stop_instance(&server, "ghost", false, &fast_config(), Deadline::none())
            .await
            .unwrap();
        assert!(!found);
    }

    #[tokio::test]
    async fn test_wait_network_resolves_when_address_appears() {
        let server = MockServer::new();
        create(&server, "c1", false).await;
        start_instance(&server, "c1", &fast_config(), Deadline::none())
            .await
            .unwrap();

        server.set_network(
            "c1",
            HashMap::from([(
                "eth0".to_string(),
                InstanceStateNetwork {
                    addresses: vec![NetworkAddress {
                        family: AddressFamily::Inet,
                        address: "10.0.0.7".to_string(),
                        netmask: "24".to_string(),
                        scope: AddressScope::Global,
                    }],
                    hwaddr: "00:16:3e:00:00:07".to_string(),
                    host_name: "veth7".to_string(),
                    mtu: 1500,
                    state: "up".to_string(),
                },
            )]),
        );

        wait_instance_network(&server, "c1", &fast_config(), Deadline::none())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_network_times_out_without_address() {
        let server = MockServer::new();
        create(&server, "c1", false).await;
        start_instance(&server, "c1", &fast_config(), Deadline::none())
            .await
            .unwrap();

        let err = wait_instance_network(&server, "c1", &fast_config(), Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PollTimeout { .. }));
    }
}
