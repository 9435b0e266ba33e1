use std::{sync::Arc, time::Duration};

use blinds_common::{
    channel::STEP_PRESS_MS,
    BlindAction, ChannelState, ChannelTarget, NavigationPlan, NavigationStep, PinLayout,
    PowerState, RemoteButton,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::pins::{HardwareError, Level, PinBus};

pub const POWER_SETTLE_MS: u64 = 3_000;
pub const POST_SELECT_SETTLE_MS: u64 = 1_000;
pub const POWER_CYCLE_CUT_MS: u64 = 2_000;
pub const PAIR_HOLD_MS: u64 = 5_000;

const QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Completed,
    /// Preconditions did not hold when the worker reached the job (e.g. power off).
    Skipped,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("a channel selection is already in progress")]
    Busy,
    #[error("remote is off")]
    PoweredOff,
    #[error("remote operation queue is full")]
    QueueFull,
    #[error("remote worker is not running")]
    WorkerGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSession {
    pub power: PowerState,
    pub channel: ChannelState,
    pub operation_in_progress: bool,
    pub blinds_lowered: bool,
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    #[cfg(test)]
    PowerOn,
    #[cfg(test)]
    PowerOff,
    Toggle,
    Press { button: RemoteButton, duration_ms: u64 },
    Navigate { target: ChannelTarget, generation: u64 },
    Pair,
    Blinds(BlindAction),
}

struct Job {
    op: Operation,
    done: oneshot::Sender<OperationOutcome>,
}

/// Resolves once the worker has finished (or dropped) the submitted job.
pub struct Completion(oneshot::Receiver<OperationOutcome>);

impl Completion {
    pub async fn wait(self) -> OperationOutcome {
        self.0.await.unwrap_or(OperationOutcome::Failed)
    }
}

struct Hardware {
    pins: PinBus,
    layout: PinLayout,
    default_channel: ChannelTarget,
    session: Mutex<RemoteSession>,
    /// Bumped to cancel whatever navigation is queued or running.
    cancel: watch::Sender<u64>,
}

/// Owns the remote's power rail and button lines. All hardware work runs on a
/// single worker task; lock order is pins, then session.
#[derive(Clone)]
pub struct RemoteController {
    hw: Arc<Hardware>,
    jobs: mpsc::Sender<Job>,
}

impl RemoteController {
    pub fn spawn(pins: PinBus, layout: PinLayout, default_channel: ChannelTarget) -> Self {
        let (cancel, _) = watch::channel(0);
        let hw = Arc::new(Hardware {
            pins,
            layout,
            default_channel,
            session: Mutex::new(RemoteSession {
                power: PowerState::Off,
                channel: default_channel.into(),
                operation_in_progress: false,
                blinds_lowered: false,
            }),
            cancel,
        });

        let (jobs, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(run_worker(hw.clone(), rx));
        Self { hw, jobs }
    }

    pub fn pin_backend(&self) -> &'static str {
        self.hw.pins.backend()
    }

    pub async fn session(&self) -> RemoteSession {
        *self.hw.session.lock().await
    }

    #[cfg(test)]
    pub async fn power_on(&self) -> Result<Completion, RemoteError> {
        self.submit(Operation::PowerOn)
    }

    #[cfg(test)]
    pub async fn power_off(&self) -> Result<Completion, RemoteError> {
        self.submit(Operation::PowerOff)
    }

    pub async fn toggle(&self) -> Result<Completion, RemoteError> {
        let session = self.hw.session.lock().await;
        if session.operation_in_progress {
            return Err(RemoteError::Busy);
        }
        self.submit(Operation::Toggle)
    }

    /// Refused while a channel selection runs; a queued press would move the
    /// remote off the selected channel.
    pub async fn press_button(
        &self,
        button: RemoteButton,
        duration_ms: u64,
    ) -> Result<Completion, RemoteError> {
        let session = self.hw.session.lock().await;
        if session.operation_in_progress {
            return Err(RemoteError::Busy);
        }
        self.submit(Operation::Press {
            button,
            duration_ms,
        })
    }

    /// Accepts at most one navigation at a time; a concurrent request is
    /// rejected without side effects.
    pub async fn go_to_channel(&self, target: ChannelTarget) -> Result<Completion, RemoteError> {
        let mut session = self.hw.session.lock().await;
        // The power cycle of a running selection makes the rail read off.
        if session.operation_in_progress {
            return Err(RemoteError::Busy);
        }
        if !session.power.is_on() {
            return Err(RemoteError::PoweredOff);
        }

        let generation = *self.hw.cancel.borrow();
        let completion = self.submit(Operation::Navigate { target, generation })?;
        session.operation_in_progress = true;
        session.channel = target.into();
        info!("channel selection accepted: {}", session.channel);
        Ok(completion)
    }

    pub async fn select_all_channels(&self) -> Result<Completion, RemoteError> {
        self.go_to_channel(ChannelTarget::All).await
    }

    pub async fn pair(&self) -> Result<Completion, RemoteError> {
        let session = self.hw.session.lock().await;
        if session.operation_in_progress {
            return Err(RemoteError::Busy);
        }
        if !session.power.is_on() {
            return Err(RemoteError::PoweredOff);
        }
        self.submit(Operation::Pair)
    }

    pub async fn lower_blinds(&self) -> Result<Completion, RemoteError> {
        self.dispatch(BlindAction::Lower).await
    }

    pub async fn raise_blinds(&self) -> Result<Completion, RemoteError> {
        self.dispatch(BlindAction::Raise).await
    }

    /// Interrupts a running channel selection before pressing Stop.
    pub async fn stop_blinds(&self) -> Result<Completion, RemoteError> {
        if self.hw.session.lock().await.operation_in_progress {
            info!("stop requested, cancelling channel selection");
            self.hw.cancel.send_modify(|generation| *generation += 1);
        }
        self.submit(Operation::Blinds(BlindAction::Stop))
    }

    /// Lower and raise are refused while a channel selection is in flight.
    pub async fn dispatch(&self, action: BlindAction) -> Result<Completion, RemoteError> {
        if action == BlindAction::Stop {
            return self.stop_blinds().await;
        }
        let session = self.hw.session.lock().await;
        if session.operation_in_progress {
            return Err(RemoteError::Busy);
        }
        self.submit(Operation::Blinds(action))
    }

    pub async fn forget_blind_position(&self) {
        self.hw.session.lock().await.blinds_lowered = false;
    }

    /// Re-reads the power rail and corrects the believed state if it drifted.
    pub async fn reconcile(&self) -> Result<Option<PowerState>, HardwareError> {
        let mut session = self.hw.session.lock().await;
        let actual = match self.hw.pins.read(self.hw.layout.power)? {
            Level::High => PowerState::On,
            Level::Low => PowerState::Off,
        };
        if actual == session.power {
            return Ok(None);
        }

        session.power = actual;
        session.channel = match actual {
            PowerState::On => ChannelState::Channel(1),
            PowerState::Off => ChannelState::Unknown,
        };
        Ok(Some(actual))
    }

    /// Drives the power rail low and releases every button line.
    pub async fn shutdown(&self) {
        self.hw.cancel.send_modify(|generation| *generation += 1);
        let pins = self.hw.pins.lock().await;
        let mut session = self.hw.session.lock().await;
        if let Err(err) = pins.drive_low(self.hw.layout.power) {
            warn!("failed to cut remote power on shutdown: {err}");
        }
        for pin in self.hw.layout.button_pins() {
            if let Err(err) = pins.release(pin) {
                warn!("failed to release pin {pin} on shutdown: {err}");
            }
        }
        session.power = PowerState::Off;
        session.channel = ChannelState::Unknown;
    }

    fn submit(&self, op: Operation) -> Result<Completion, RemoteError> {
        let (done, rx) = oneshot::channel();
        self.jobs
            .try_send(Job { op, done })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => RemoteError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => RemoteError::WorkerGone,
            })?;
        Ok(Completion(rx))
    }
}

async fn run_worker(hw: Arc<Hardware>, mut jobs: mpsc::Receiver<Job>) {
    if let Err(err) = hw.initialize().await {
        warn!("remote pin initialization failed: {err}");
    }

    while let Some(Job { op, done }) = jobs.recv().await {
        debug!("remote operation started: {op:?}");
        let outcome = hw.execute(op).await;
        debug!("remote operation finished: {op:?} -> {outcome:?}");
        // The caller may have stopped waiting; that is fine.
        let _ = done.send(outcome);
    }
}

struct CancelToken {
    rx: watch::Receiver<u64>,
    generation: u64,
}

impl CancelToken {
    fn is_cancelled(&self) -> bool {
        *self.rx.borrow() != self.generation
    }

    /// Returns false if cancelled before `ms` elapsed.
    async fn sleep(&mut self, ms: u64) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let generation = self.generation;
        let rx = &mut self.rx;
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(ms)) => true,
            _ = async { rx.wait_for(|current| *current != generation).await.is_ok() } => false,
        }
    }
}

async fn pause(ms: u64, cancel: Option<&mut CancelToken>) -> bool {
    match cancel {
        Some(token) => token.sleep(ms).await,
        None => {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            true
        }
    }
}

impl Hardware {
    async fn initialize(&self) -> Result<(), HardwareError> {
        let pins = self.pins.lock().await;
        let mut session = self.session.lock().await;
        pins.drive_low(self.layout.power)?;
        session.power = PowerState::Off;
        for pin in self.layout.button_pins() {
            pins.release(pin)?;
        }
        Ok(())
    }

    async fn execute(&self, op: Operation) -> OperationOutcome {
        match op {
            #[cfg(test)]
            Operation::PowerOn => self.power_on().await,
            #[cfg(test)]
            Operation::PowerOff => self.power_off().await,
            Operation::Toggle => {
                if self.power_is_on().await {
                    self.power_off().await
                } else {
                    self.power_on().await
                }
            }
            Operation::Press {
                button,
                duration_ms,
            } => self.press(button, duration_ms, None).await,
            Operation::Navigate { target, generation } => self.navigate(target, generation).await,
            Operation::Pair => self.pair().await,
            Operation::Blinds(action) => self.blinds(action).await,
        }
    }

    /// Physical rail level wins over the believed state.
    async fn power_is_on(&self) -> bool {
        match self.pins.read(self.layout.power) {
            Ok(level) => level == Level::High,
            Err(err) => {
                warn!("power pin read failed, using believed state: {err}");
                self.session.lock().await.power.is_on()
            }
        }
    }

    /// Buttons go back to pulled-up inputs before the rail comes up.
    async fn raise_power(&self) -> Result<(), HardwareError> {
        let pins = self.pins.lock().await;
        for pin in self.layout.button_pins() {
            pins.release(pin)?;
        }
        let mut session = self.session.lock().await;
        pins.drive_high(self.layout.power)?;
        session.power = PowerState::On;
        Ok(())
    }

    async fn cut_power(&self) -> Result<(), HardwareError> {
        let pins = self.pins.lock().await;
        let mut session = self.session.lock().await;
        pins.drive_low(self.layout.power)?;
        session.power = PowerState::Off;
        Ok(())
    }

    async fn power_on(&self) -> OperationOutcome {
        if self.power_is_on().await {
            self.session.lock().await.power = PowerState::On;
            return OperationOutcome::Skipped;
        }

        if let Err(err) = self.raise_power().await {
            warn!("remote power on failed: {err}");
            return OperationOutcome::Failed;
        }
        self.session.lock().await.channel = ChannelState::Channel(1);
        info!("remote powered on");
        tokio::time::sleep(Duration::from_millis(POWER_SETTLE_MS)).await;

        let outcome = match NavigationPlan::for_target(self.default_channel) {
            Ok(plan) => self.run_steps(&plan, None).await,
            Err(err) => {
                warn!("default channel is not navigable: {err}");
                OperationOutcome::Failed
            }
        };
        if outcome == OperationOutcome::Completed {
            self.session.lock().await.channel = self.default_channel.into();
        }
        tokio::time::sleep(Duration::from_millis(POST_SELECT_SETTLE_MS)).await;
        outcome
    }

    async fn power_off(&self) -> OperationOutcome {
        if let Err(err) = self.cut_power().await {
            warn!("remote power off failed: {err}");
            return OperationOutcome::Failed;
        }
        self.session.lock().await.channel = ChannelState::Unknown;
        info!("remote powered off");
        OperationOutcome::Completed
    }

    /// Holds `button` low for `duration_ms`. The pin is released even when
    /// the hold is cut short by cancellation.
    async fn press(
        &self,
        button: RemoteButton,
        duration_ms: u64,
        cancel: Option<&mut CancelToken>,
    ) -> OperationOutcome {
        let pin = self.layout.pin(button);
        let pins = self.pins.lock().await;
        {
            let session = self.session.lock().await;
            if !session.power.is_on() {
                debug!("ignoring {button} press while remote is off");
                return OperationOutcome::Skipped;
            }
            if let Err(err) = pins.drive_low(pin) {
                warn!("{button} press failed: {err}");
                return OperationOutcome::Failed;
            }
        }

        let held = pause(duration_ms, cancel).await;
        if let Err(err) = pins.release(pin) {
            warn!("{button} release failed: {err}");
            return OperationOutcome::Failed;
        }
        debug!("pressed {button} for {duration_ms}ms");

        if held {
            OperationOutcome::Completed
        } else {
            OperationOutcome::Cancelled
        }
    }

    async fn run_steps(
        &self,
        plan: &NavigationPlan,
        mut cancel: Option<&mut CancelToken>,
    ) -> OperationOutcome {
        for step in plan.steps() {
            let outcome = match step {
                NavigationStep::Press(button, ms) => {
                    self.press(button, ms, cancel.as_deref_mut()).await
                }
                NavigationStep::Dwell(ms) => {
                    if pause(ms, cancel.as_deref_mut()).await {
                        OperationOutcome::Completed
                    } else {
                        OperationOutcome::Cancelled
                    }
                }
            };
            match outcome {
                OperationOutcome::Completed => {}
                // A press skipped mid-sequence means the rail dropped underneath us.
                OperationOutcome::Skipped => return OperationOutcome::Failed,
                other => return other,
            }
        }
        OperationOutcome::Completed
    }

    async fn navigate(&self, target: ChannelTarget, generation: u64) -> OperationOutcome {
        let mut cancel = CancelToken {
            rx: self.cancel.subscribe(),
            generation,
        };

        let outcome = match NavigationPlan::for_target(target) {
            Ok(plan) => self.power_cycle_and_walk(&plan, &mut cancel).await,
            Err(err) => {
                warn!("channel selection rejected: {err}");
                OperationOutcome::Failed
            }
        };

        let mut session = self.session.lock().await;
        session.operation_in_progress = false;
        if outcome != OperationOutcome::Completed {
            session.channel = ChannelState::Unknown;
        }
        info!("channel selection finished ({outcome:?}): {}", session.channel);
        outcome
    }

    /// The remote only resets to channel 1 on power-up, so every selection
    /// starts from a power cycle.
    async fn power_cycle_and_walk(
        &self,
        plan: &NavigationPlan,
        cancel: &mut CancelToken,
    ) -> OperationOutcome {
        if cancel.is_cancelled() {
            return OperationOutcome::Cancelled;
        }
        if let Err(err) = self.cut_power().await {
            warn!("power cycle failed: {err}");
            return OperationOutcome::Failed;
        }
        if !cancel.sleep(POWER_CYCLE_CUT_MS).await {
            return OperationOutcome::Cancelled;
        }
        if let Err(err) = self.raise_power().await {
            warn!("power cycle failed: {err}");
            return OperationOutcome::Failed;
        }
        if !cancel.sleep(POWER_SETTLE_MS).await {
            return OperationOutcome::Cancelled;
        }
        self.run_steps(plan, Some(cancel)).await
    }

    async fn pair(&self) -> OperationOutcome {
        let outcome = self.press(RemoteButton::Up, PAIR_HOLD_MS, None).await;
        if outcome == OperationOutcome::Completed {
            info!("held Up for {PAIR_HOLD_MS}ms (pairing)");
        }
        outcome
    }

    async fn blinds(&self, action: BlindAction) -> OperationOutcome {
        if !self.power_is_on().await {
            let powered = self.power_on().await;
            if !matches!(
                powered,
                OperationOutcome::Completed | OperationOutcome::Skipped
            ) {
                return powered;
            }
        }

        let button = match action {
            BlindAction::Lower => RemoteButton::Down,
            BlindAction::Raise => RemoteButton::Up,
            BlindAction::Stop => RemoteButton::Stop,
        };
        let outcome = self.press(button, STEP_PRESS_MS, None).await;
        if outcome == OperationOutcome::Completed {
            let mut session = self.session.lock().await;
            match action {
                BlindAction::Lower => session.blinds_lowered = true,
                BlindAction::Raise => session.blinds_lowered = false,
                BlindAction::Stop => {}
            }
            info!("blinds {}: pressed {button}", action.as_str());
        }
        outcome
    }
}
