use std::future::Future;

use heater_common::SwitchState;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// A network switch that can be driven on or off.
pub trait Switch: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn set_state(&self, state: SwitchState) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn current_state(&self) -> impl Future<Output = anyhow::Result<SwitchState>> + Send;
}

/// Sending side of the command queue. Commands issued before the switch is
/// discovered wait in the queue and are applied in order once it is.
#[derive(Clone)]
pub struct ActuatorHandle {
    commands: UnboundedSender<SwitchState>,
}

impl ActuatorHandle {
    pub fn channel() -> (Self, UnboundedReceiver<SwitchState>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        (Self { commands }, receiver)
    }

    pub fn send(&self, state: SwitchState) {
        if self.commands.send(state).is_err() {
            warn!(
                "actuator task is gone, dropping heater {} command",
                state.as_str()
            );
        }
    }
}

pub fn spawn_actuator<S, D>(discovery: D, commands: UnboundedReceiver<SwitchState>) -> JoinHandle<()>
where
    S: Switch,
    D: Future<Output = anyhow::Result<S>> + Send + 'static,
{
    tokio::spawn(run_actuator(discovery, commands))
}

async fn run_actuator<S, D>(discovery: D, mut commands: UnboundedReceiver<SwitchState>)
where
    S: Switch,
    D: Future<Output = anyhow::Result<S>>,
{
    let switch = match discovery.await {
        Ok(switch) => switch,
        Err(err) => {
            error!("FAILURE FINDING HEATER SWITCH: {err:#}; heater commands will be dropped");
            while let Some(state) = commands.recv().await {
                debug!("no heater switch, dropping {} command", state.as_str());
            }
            return;
        }
    };

    info!("Found the {} Switch.", switch.name());
    match switch.current_state().await {
        Ok(state) => info!("Switch {} is {}", switch.name(), state.as_str()),
        Err(err) => warn!("failed to read state of {}: {err:#}", switch.name()),
    }

    while let Some(state) = commands.recv().await {
        match switch.set_state(state).await {
            Ok(()) => debug!("switch {} commanded {}", switch.name(), state.as_str()),
            Err(err) => warn!(
                "failed to turn {} {}: {err:#}",
                switch.name(),
                state.as_str()
            ),
        }
    }
}
