//! Async channel bridge between the PnP loader thread and the driver host
//!
//! The loader runs on a dedicated blocking thread. PnP events reach it as
//! [`LoaderCommand`]s; it answers with [`DriverRequest`]s that the Tokio-side
//! driver host acknowledges through a oneshot channel.

use async_channel::{Receiver, Sender, bounded};
use protocol::{DriverBinding, PnpEvent};

/// Queue depth for both directions
const BRIDGE_CAPACITY: usize = 256;

/// Input to the loader thread
#[derive(Debug)]
pub enum LoaderCommand {
    /// A device or interface arrived or left
    Event(PnpEvent),
    /// Stop the loader loop
    Shutdown,
}

/// Requests from the loader thread to the driver host
#[derive(Debug)]
pub enum DriverRequest {
    /// Bind a driver to a matched device
    Register {
        binding: DriverBinding,
        /// Channel to send the host's verdict back
        response: tokio::sync::oneshot::Sender<crate::Result<()>>,
    },
    /// Unbind a driver from a removed device
    Unregister {
        binding: DriverBinding,
        response: tokio::sync::oneshot::Sender<crate::Result<()>>,
    },
}

impl DriverRequest {
    pub fn binding(&self) -> &DriverBinding {
        match self {
            DriverRequest::Register { binding, .. } | DriverRequest::Unregister { binding, .. } => {
                binding
            }
        }
    }
}

/// Handle for the Tokio runtime (async)
#[derive(Clone)]
pub struct PnpBridge {
    cmd_tx: Sender<LoaderCommand>,
    request_rx: Receiver<DriverRequest>,
}

impl PnpBridge {
    /// Send a PnP event to the loader thread
    pub async fn send_event(&self, event: PnpEvent) -> crate::Result<()> {
        self.cmd_tx
            .send(LoaderCommand::Event(event))
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Ask the loader thread to stop
    pub async fn shutdown(&self) -> crate::Result<()> {
        self.cmd_tx
            .send(LoaderCommand::Shutdown)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next driver request from the loader thread
    pub async fn recv_request(&self) -> crate::Result<DriverRequest> {
        self.request_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the loader thread (blocking)
pub struct PnpWorker {
    pub(crate) cmd_rx: Receiver<LoaderCommand>,
    cmd_tx: Sender<LoaderCommand>,
    /// Request sender (public so registrars can be built around it)
    pub request_tx: Sender<DriverRequest>,
}

impl PnpWorker {
    /// Receive a command (blocking)
    pub fn recv_command(&self) -> crate::Result<LoaderCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<LoaderCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Sender for in-process notifiers (e.g. interface add/remove on a session)
    pub fn event_sender(&self) -> Sender<LoaderCommand> {
        self.cmd_tx.clone()
    }

    /// Send a driver request and block until the host answers
    pub fn request_blocking(&self, register: bool, binding: DriverBinding) -> crate::Result<()> {
        send_request_blocking(&self.request_tx, register, binding)
    }
}

/// Send a register/unregister request and wait for the host's verdict
pub fn send_request_blocking(
    request_tx: &Sender<DriverRequest>,
    register: bool,
    binding: DriverBinding,
) -> crate::Result<()> {
    let (response, verdict) = tokio::sync::oneshot::channel();
    let request = if register {
        DriverRequest::Register { binding, response }
    } else {
        DriverRequest::Unregister { binding, response }
    };
    request_tx
        .send_blocking(request)
        .map_err(|e| crate::Error::Channel(e.to_string()))?;
    verdict
        .blocking_recv()
        .map_err(|e| crate::Error::Channel(e.to_string()))?
}

/// Create the channel bridge between Tokio and the loader thread
///
/// Returns (PnpBridge for Tokio, PnpWorker for the loader thread)
pub fn create_pnp_bridge() -> (PnpBridge, PnpWorker) {
    let (cmd_tx, cmd_rx) = bounded(BRIDGE_CAPACITY);
    let (request_tx, request_rx) = bounded(BRIDGE_CAPACITY);

    (
        PnpBridge {
            cmd_tx: cmd_tx.clone(),
            request_rx,
        },
        PnpWorker {
            cmd_rx,
            cmd_tx,
            request_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::DeviceAddress;

    fn binding() -> DriverBinding {
        DriverBinding {
            module_name: "usb_ecm".into(),
            service_name: "ecm_service".into(),
            match_attr: "ecm_attr".into(),
            address: DeviceAddress::new(1, 2),
            interface_numbers: vec![0, 1],
        }
    }

    #[tokio::test]
    async fn test_register_round_trip() {
        let (bridge, worker) = create_pnp_bridge();

        let handle = std::thread::spawn(move || worker.request_blocking(true, binding()));

        match bridge.recv_request().await.unwrap() {
            DriverRequest::Register { binding, response } => {
                assert_eq!(binding.interface_numbers, vec![0, 1]);
                response.send(Ok(())).unwrap();
            }
            other => panic!("unexpected request: {:?}", other),
        }

        assert!(handle.join().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_host_rejection_propagates() {
        let (bridge, worker) = create_pnp_bridge();

        let handle = std::thread::spawn(move || worker.request_blocking(false, binding()));

        let request = bridge.recv_request().await.unwrap();
        assert!(matches!(request, DriverRequest::Unregister { .. }));
        if let DriverRequest::Unregister { response, .. } = request {
            response
                .send(Err(crate::Error::NotFound("no such driver".into())))
                .unwrap();
        }

        assert!(matches!(
            handle.join().unwrap(),
            Err(crate::Error::NotFound(_))
        ));
    }
}
