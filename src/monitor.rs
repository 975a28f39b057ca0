use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::{Stream, StreamExt};
use stream_cancel::{Trigger, Valved};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::connection::{ConnectionState, LinkId};
use crate::error::{Error, Failure, Result};
use crate::gate::AdapterGate;
use crate::link::Link;
use crate::machine::{Effect, Event, Machine};
use crate::sink::ResultSink;
use crate::TargetDescriptor;

#[derive(Debug, Default, Clone)]
pub struct MonitorConfig {
    /// Index of the Bluetooth adapter to use. The first found adapter is used by default.
    adapter_index: usize,
}

impl MonitorConfig {
    /// Index of bluetooth adapter to use
    pub fn adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }
}

enum Command {
    StartScan(oneshot::Sender<Result<()>>),
    StopScan,
    Close(oneshot::Sender<std::result::Result<(), Failure>>),
}

enum Input {
    Command(Command),
    Central(CentralEvent),
    Event(Event),
}

/// Follows the target peripheral and publishes its readings.
///
/// `start` binds the monitor to a Bluetooth adapter; `close` releases
/// everything again and must be called once for every successful `start`.
/// Scanning, connecting and subscribing only issue requests; progress is
/// reported to the sink and through [`Monitor::state`].
pub struct Monitor {
    target: TargetDescriptor,
    gate: Arc<dyn AdapterGate>,
    sink: Arc<dyn ResultSink>,
    state_sender: Arc<watch::Sender<ConnectionState>>,
    state_receiver: watch::Receiver<ConnectionState>,
    inputs: Option<mpsc::UnboundedSender<Input>>,
    event_stopper: Option<Trigger>,
    worker: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn new(
        target: TargetDescriptor,
        gate: impl AdapterGate + 'static,
        sink: impl ResultSink + 'static,
    ) -> Self {
        let (state_sender, state_receiver) = watch::channel(ConnectionState::Idle);

        Self {
            target,
            gate: Arc::new(gate),
            sink: Arc::new(sink),
            state_sender: Arc::new(state_sender),
            state_receiver,
            inputs: None,
            event_stopper: None,
            worker: None,
        }
    }

    #[inline]
    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    /// Watch the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_receiver.clone()
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.inputs.is_some()
    }

    /// Open the adapter and start processing events.
    pub async fn start(&mut self, config: MonitorConfig) -> Result<()> {
        if self.inputs.is_some() {
            log::info!("Monitor is already started.");
            return Ok(());
        }

        let manager = Manager::new().await?;
        let mut adapters = manager.adapters().await?;

        if config.adapter_index >= adapters.len() {
            return Err(Error::AdapterNotFound(config.adapter_index));
        }

        let adapter = adapters.swap_remove(config.adapter_index);

        log::trace!("Using adapter: {:?}", adapter);

        let (inputs, receiver) = mpsc::unbounded_channel();
        let (event_stopper, mut central_events) = Valved::new(adapter.events().await?);

        let forward = inputs.clone();
        tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                if forward.send(Input::Central(event)).is_err() {
                    break;
                }
            }
            log::trace!("Adapter event stream ended");
        });

        let worker = Worker {
            _manager: manager,
            adapter,
            machine: Machine::new(self.target.clone()),
            gate: self.gate.clone(),
            sink: self.sink.clone(),
            state: self.state_sender.clone(),
            inputs: inputs.downgrade(),
            link: None,
            notification_stopper: None,
        };

        self.worker = Some(tokio::spawn(worker.run(receiver)));
        self.inputs = Some(inputs);
        self.event_stopper = Some(event_stopper);

        Ok(())
    }

    /// Start scanning for the target. Returns once the scan was requested.
    pub async fn start_scan(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::StartScan(reply))?;
        response.await.map_err(|_| Error::WorkerGone)?
    }

    /// Stop scanning. Does nothing if no scan is running.
    pub fn stop_scan(&self) -> Result<()> {
        self.send(Command::StopScan)
    }

    /// Stop scanning, release the link and stop processing events.
    ///
    /// Closing a monitor that is not started is a no-op. If connect capability
    /// was revoked the link is kept, `CloseDenied` is returned and the monitor
    /// keeps running so that `close` can be tried again.
    pub async fn close(&mut self) -> Result<()> {
        if self.inputs.is_none() {
            log::debug!("Monitor is already closed");
            return Ok(());
        }

        let (reply, response) = oneshot::channel();
        self.send(Command::Close(reply))?;
        response.await.map_err(|_| Error::WorkerGone)??;

        self.inputs.take();
        self.event_stopper.take();

        if let Some(worker) = self.worker.take() {
            worker.await.ok();
        }

        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inputs
            .as_ref()
            .ok_or(Error::NotStarted)?
            .send(Input::Command(command))
            .map_err(|_| Error::WorkerGone)
    }
}

/// Owns the adapter, the state machine and the link. Every input is handled
/// here, one at a time.
struct Worker {
    _manager: Manager,
    adapter: Adapter,
    machine: Machine,
    gate: Arc<dyn AdapterGate>,
    sink: Arc<dyn ResultSink>,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Completions of spawned transport operations and notifications are sent
    /// back through here. Every holder keeps it weak, so the loop ends once the
    /// monitor and its event stream are gone.
    inputs: mpsc::WeakUnboundedSender<Input>,
    link: Option<(LinkId, Link)>,
    notification_stopper: Option<Trigger>,
}

impl Worker {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = receiver.recv().await {
            let closed = self.on_input(input).await;
            self.state.send(self.machine.state().clone()).ok();

            if closed {
                break;
            }
        }

        if self.link.is_some() {
            log::warn!("Monitor stopped without releasing the link");
        }

        log::info!("Monitor was stopped.");
    }

    /// Returns `true` once the monitor has been closed.
    async fn on_input(&mut self, input: Input) -> bool {
        match input {
            Input::Command(Command::StartScan(reply)) => {
                let result = match self.machine.start_scan(&*self.gate) {
                    Ok(effects) => {
                        self.execute(effects).await;
                        Ok(())
                    }
                    Err(rejected) => {
                        self.execute(rejected.effects).await;
                        Err(rejected.error)
                    }
                };
                reply.send(result).ok();
            }
            Input::Command(Command::StopScan) => {
                let effects = self.machine.stop_scan();
                self.execute(effects).await;
            }
            Input::Command(Command::Close(reply)) => match self.machine.close(&*self.gate) {
                Ok(effects) => {
                    self.execute(effects).await;
                    reply.send(Ok(())).ok();
                    return true;
                }
                Err(rejected) => {
                    self.execute(rejected.effects).await;
                    reply.send(Err(rejected.error)).ok();
                }
            },
            Input::Central(event) => {
                if let Some(event) = self.translate(event).await {
                    let effects = self.machine.handle(event, &*self.gate);
                    self.execute(effects).await;
                }
            }
            Input::Event(event) => {
                let effects = self.machine.handle(event, &*self.gate);
                self.execute(effects).await;
            }
        }

        false
    }

    /// Map adapter events onto the scan or link they concern.
    async fn translate(&self, event: CentralEvent) -> Option<Event> {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let scan = self.machine.active_scan()?;
                let peripheral = self.adapter.peripheral(&id).await.ok()?;
                Some(Event::Advertisement {
                    scan,
                    address: peripheral.address(),
                })
            }
            CentralEvent::DeviceConnected(id) => self.current_link(&id).map(Event::LinkUp),
            CentralEvent::DeviceDisconnected(id) => self.current_link(&id).map(Event::LinkDown),
            _ => None,
        }
    }

    fn current_link(&self, id: &PeripheralId) -> Option<LinkId> {
        match &self.link {
            Some((link, handle)) if &handle.id() == id => Some(*link),
            _ => None,
        }
    }

    async fn execute(&mut self, effects: Vec<Effect>) {
        let mut queue = EffectQueue::new(effects);

        while let Some(effect) = queue.pop() {
            if let Some(event) = self.apply(effect).await {
                queue.feed(&mut self.machine, event, &*self.gate);
            }
        }
    }

    /// Carry out one effect. Returns an event when the outcome is known
    /// immediately.
    async fn apply(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::StartScan(scan) => {
                log::info!("Starting the scan");
                if let Err(e) = self.adapter.start_scan(ScanFilter::default()).await {
                    return Some(Event::ScanFailed {
                        scan,
                        reason: e.to_string(),
                    });
                }
            }
            Effect::StopScan(_) => {
                if let Err(e) = self.adapter.stop_scan().await {
                    log::debug!("Failed to stop scan cleanly: {}", e);
                }
            }
            Effect::Connect { link, address } => {
                let handle = match Link::find(&self.adapter, address).await {
                    Ok(Some(handle)) => handle,
                    Ok(None) => {
                        return Some(Event::ConnectFailed {
                            link,
                            reason: format!("{} is no longer known to the adapter", address),
                        })
                    }
                    Err(e) => {
                        return Some(Event::ConnectFailed {
                            link,
                            reason: e.to_string(),
                        })
                    }
                };
                self.link = Some((link, handle.clone()));

                self.spawn(async move {
                    match handle.connect().await {
                        Ok(()) => Event::LinkUp(link),
                        Err(e) => Event::ConnectFailed {
                            link,
                            reason: e.to_string(),
                        },
                    }
                });
            }
            Effect::DiscoverServices(link) => {
                let handle = self.handle_for(link)?;
                self.spawn(async move {
                    match handle.discover().await {
                        Ok(services) => Event::ServicesDiscovered { link, services },
                        Err(e) => Event::DiscoveryFailed {
                            link,
                            reason: e.to_string(),
                        },
                    }
                });
            }
            Effect::EnableNotifications {
                link,
                characteristic,
                descriptor,
            } => {
                let handle = self.handle_for(link)?;
                if self.notification_stopper.is_none() {
                    self.pump_notifications(link, &handle).await;
                }

                log::debug!(
                    "Writing descriptor {} of {}",
                    descriptor,
                    characteristic
                );
                self.spawn(async move {
                    Event::DescriptorWritten {
                        link,
                        characteristic,
                        result: handle
                            .enable_notifications(characteristic)
                            .await
                            .map_err(|e| e.to_string()),
                    }
                });
            }
            Effect::Release(link) => {
                if let Some(handle) = take_current(&mut self.link, link) {
                    self.notification_stopper.take();
                    if let Err(e) = handle.release().await {
                        log::warn!("Could not release link to {}: {}", handle.address(), e);
                    }
                }
            }
            Effect::Publish(update) => self.sink.publish(update),
        }

        None
    }

    fn handle_for(&self, link: LinkId) -> Option<Link> {
        match &self.link {
            Some((current, handle)) if *current == link => Some(handle.clone()),
            _ => {
                log::debug!("No handle for link {:?}", link);
                None
            }
        }
    }

    /// Forward notifications of `link` into the event loop until the link is
    /// released.
    async fn pump_notifications(&mut self, link: LinkId, handle: &Link) {
        let stream = match handle
            .notifications(self.machine.target().characteristic_uuids().to_vec())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Could not get notification stream: {}", e);
                return;
            }
        };

        let (stopper, stream) = Valved::new(stream);
        self.notification_stopper = Some(stopper);

        tokio::spawn(forward_notifications(stream, link, self.inputs.clone()));
    }

    /// Run a transport operation off the event loop and feed its outcome back in.
    fn spawn<F>(&self, operation: F)
    where
        F: std::future::Future<Output = Event> + Send + 'static,
    {
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let event = operation.await;
            if let Some(inputs) = inputs.upgrade() {
                inputs.send(Input::Event(event)).ok();
            }
        });
    }
}

/// Effects still to be carried out, in order.
struct EffectQueue(VecDeque<Effect>);

impl EffectQueue {
    fn new(effects: Vec<Effect>) -> Self {
        Self(effects.into())
    }

    fn pop(&mut self) -> Option<Effect> {
        self.0.pop_front()
    }

    /// Hand an immediate outcome to the machine. What it asks for runs after
    /// everything already queued.
    fn feed<G: AdapterGate + ?Sized>(&mut self, machine: &mut Machine, event: Event, gate: &G) {
        self.0.extend(machine.handle(event, gate));
    }
}

/// Take the handle out of `slot` if it belongs to `link`.
fn take_current<T>(slot: &mut Option<(LinkId, T)>, link: LinkId) -> Option<T> {
    if slot.as_ref().map_or(false, |(current, _)| *current == link) {
        slot.take().map(|(_, handle)| handle)
    } else {
        None
    }
}

/// Feed notifications into the event loop until the stream ends or the loop
/// is gone. Only a weak sender is held between notifications.
async fn forward_notifications<S>(
    stream: S,
    link: LinkId,
    inputs: mpsc::WeakUnboundedSender<Input>,
) where
    S: Stream<Item = ValueNotification>,
{
    futures::pin_mut!(stream);

    while let Some(notification) = stream.next().await {
        let inputs = match inputs.upgrade() {
            Some(inputs) => inputs,
            None => break,
        };
        let event = Event::ValueChanged {
            link,
            characteristic: notification.uuid,
            value: notification.value,
            received_at: SystemTime::now(),
        };
        if inputs.send(Input::Event(event)).is_err() {
            break;
        }
    }

    log::trace!("Notification stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{RadioCapability, SharedCapability};
    use crate::sink::{Status, Update};
    use uuid::Uuid;

    fn notification(value: u8) -> ValueNotification {
        ValueNotification {
            uuid: Uuid::nil(),
            value: vec![value],
        }
    }

    fn drain(mut queue: EffectQueue) -> Vec<Effect> {
        let mut effects = Vec::new();
        while let Some(effect) = queue.pop() {
            effects.push(effect);
        }
        effects
    }

    #[test]
    fn immediate_outcomes_run_after_queued_effects() {
        let gate = SharedCapability::new(RadioCapability::Available);
        let mut machine = Machine::new(TargetDescriptor::parse("AA:BB:CC:DD:EE:FF").unwrap());
        let mut queue = EffectQueue::new(machine.start_scan(&gate).unwrap());

        let scan = match queue.pop() {
            Some(Effect::StartScan(scan)) => scan,
            other => panic!("unexpected effect {:?}", other),
        };
        queue.feed(
            &mut machine,
            Event::ScanFailed {
                scan,
                reason: "adapter busy".into(),
            },
            &gate,
        );

        let failure = Failure::ScanFailed("adapter busy".into());
        assert_eq!(
            drain(queue),
            vec![
                Effect::Publish(Update::Status(Status::Scanning)),
                Effect::StopScan(scan),
                Effect::Publish(Update::Status(Status::Failed(failure.clone()))),
            ]
        );
        assert_eq!(machine.state(), &ConnectionState::Failed(failure));
    }

    #[test]
    fn release_of_a_stale_link_keeps_the_current_handle() {
        let mut slot = Some((LinkId(2), "current"));

        assert_eq!(take_current(&mut slot, LinkId(1)), None);
        assert_eq!(slot, Some((LinkId(2), "current")));

        assert_eq!(take_current(&mut slot, LinkId(2)), Some("current"));
        assert_eq!(slot, None);
        assert_eq!(take_current(&mut slot, LinkId(2)), None);
    }

    #[tokio::test]
    async fn notifications_are_forwarded_in_order() {
        let (inputs, mut receiver) = mpsc::unbounded_channel();
        let stream = futures::stream::iter(vec![notification(1), notification(2)]);

        forward_notifications(stream, LinkId(4), inputs.downgrade()).await;
        drop(inputs);

        let mut values = Vec::new();
        while let Some(input) = receiver.recv().await {
            match input {
                Input::Event(Event::ValueChanged { link, value, .. }) => {
                    assert_eq!(link, LinkId(4));
                    values.push(value);
                }
                _ => panic!("unexpected input"),
            }
        }
        assert_eq!(values, vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn idle_notification_stream_does_not_keep_the_loop_alive() {
        let (inputs, mut receiver) = mpsc::unbounded_channel::<Input>();
        let forwarder = tokio::spawn(forward_notifications(
            futures::stream::pending::<ValueNotification>(),
            LinkId(1),
            inputs.downgrade(),
        ));

        drop(inputs);

        assert!(receiver.recv().await.is_none());
        forwarder.abort();
    }
}
