pub mod bridge;
pub mod error;
pub mod handle;
pub mod logger;
pub mod managed_process;
pub mod process;
pub mod state_machine;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::UnitConfig;
use crate::protocol::{CorrelationId, InvocationOutcome, ModuleReady};
use crate::watch::{WatchMonitor, WatchSet, WatchSignal};
use bridge::{InboundHandler, InvocationBridge};
use handle::{HandleCell, HandleState};
use logger::UnitLogger;
use managed_process::{ManagedWorker, WorkerPhase, WorkerSignal};
use state_machine::{Action, Event, StateMachine};

pub use error::{ModuleError, SupervisorError};
pub use handle::{Module, ModuleFn};

const BUFFERED_DISCARDED_NOTICE: &str = "There were executions buffered, but the module is not a \
     function anymore. Buffered executions has been forgotten.";

/// Requests from callers, serialized through the unit task
pub(crate) enum Command {
    Invoke {
        args: Vec<Value>,
        reply: oneshot::Sender<Result<Value, ModuleError>>,
    },
    Restart,
    Kill,
}

/// Caller-side handle of one supervised module.
///
/// Clones share the same unit. Dropping every clone does not stop the
/// worker; call [`Unit::kill`] for that.
#[derive(Clone)]
pub struct Unit {
    commands: mpsc::UnboundedSender<Command>,
    handle_rx: watch::Receiver<HandleState>,
    killed: CancellationToken,
    proxy: ModuleFn,
    logger: UnitLogger,
    disabled: bool,
}

impl Unit {
    /// The current module, once the running worker announced it.
    pub async fn module(&self) -> Result<Module, ModuleError> {
        let mut rx = self.handle_rx.clone();
        handle::settled(&mut rx).await
    }

    /// The stable proxy of a function module. Usable before the first
    /// `moduleReady`: calls are buffered until a worker takes them.
    pub fn function(&self) -> ModuleFn {
        self.proxy.clone()
    }

    /// Reload the module as if its files changed.
    pub fn restart(&self) {
        if self.disabled {
            self.logger.info("Restart ignored, unit is disabled");
            return;
        }
        if self.commands.send(Command::Restart).is_err() {
            self.logger.error("Module killed - cannot restart");
        }
    }

    /// Stop the worker and the watcher. Resolves once both are gone;
    /// every caller of `kill` resolves at the same moment.
    pub async fn kill(&self) {
        let _ = self.commands.send(Command::Kill);
        self.killed.cancelled().await;
    }

    pub fn is_killed(&self) -> bool {
        self.killed.is_cancelled()
    }

    /// Module file name, as used in log output
    pub fn name(&self) -> &str {
        self.logger.module()
    }
}

/// Start supervising a module. Must be called within a tokio runtime.
pub fn launch(config: UnitConfig) -> Result<Unit, SupervisorError> {
    config.validate()?;
    let watch_set = config.watch_set()?;
    let logger = UnitLogger::new(&config.path, config.quiet);

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (watch_tx, watch_rx) = mpsc::unbounded_channel();
    let (worker_tx, worker_rx) = mpsc::unbounded_channel();

    let handle = HandleCell::new();
    let handle_rx = handle.subscribe();
    let proxy = ModuleFn::new(command_tx.clone());
    let killed = CancellationToken::new();
    let disabled = config.disabled;

    tracing::debug!(module = %logger.module(), "Launching unit for {}", config.path.display());

    let supervisor = Supervisor {
        config,
        logger: logger.clone(),
        machine: StateMachine::new(),
        bridge: InvocationBridge::new(),
        handle,
        proxy: proxy.clone(),
        current: None,
        worker: None,
        generation: 0,
        monitor: None,
        watch_set: Some(watch_set),
        watch_tx,
        worker_tx,
        killed: killed.clone(),
    };
    tokio::spawn(supervisor.run(command_rx, watch_rx, worker_rx));

    Ok(Unit {
        commands: command_tx,
        handle_rx,
        killed,
        proxy,
        logger,
        disabled,
    })
}

/// Owns everything of one unit; driven by a single task.
struct Supervisor {
    config: UnitConfig,
    logger: UnitLogger,
    machine: StateMachine,
    bridge: InvocationBridge,
    handle: HandleCell,
    proxy: ModuleFn,
    /// Last module announced by a worker that reached `Accessible`
    current: Option<ModuleReady>,
    worker: Option<ManagedWorker>,
    generation: u64,
    monitor: Option<WatchMonitor>,
    watch_set: Option<WatchSet>,
    watch_tx: mpsc::UnboundedSender<WatchSignal>,
    worker_tx: mpsc::UnboundedSender<WorkerSignal>,
    killed: CancellationToken,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut watch_rx: mpsc::UnboundedReceiver<WatchSignal>,
        mut worker_rx: mpsc::UnboundedReceiver<WorkerSignal>,
    ) {
        // kill() waiters must never hang, even if this task dies
        let _killed = self.killed.clone().drop_guard();

        self.apply(Event::Start);

        while !self.machine.is_killed() {
            tokio::select! {
                Some(command) = commands.recv() => self.on_command(command),
                Some(signal) = watch_rx.recv() => self.on_watch(signal),
                Some(signal) = worker_rx.recv() => self.on_worker(signal),
                else => break,
            }
        }

        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Invoke { reply, .. } = command {
                let _ = reply.send(Err(ModuleError::ExecutionOnKilledModule));
            }
        }
        tracing::debug!(module = %self.logger.module(), "Unit task finished");
    }

    fn apply(&mut self, event: Event) {
        for action in self.machine.handle(event) {
            self.execute(action);
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Invoke { args, reply } => self.invoke(args, reply),
            Command::Restart => self.apply(Event::RestartRequested),
            Command::Kill => self.apply(Event::KillRequested),
        }
    }

    fn invoke(&mut self, args: Vec<Value>, reply: oneshot::Sender<Result<Value, ModuleError>>) {
        if self.machine.kill_requested() {
            let _ = reply.send(Err(ModuleError::ExecutionOnKilledModule));
            return;
        }
        if self.machine.is_failed() {
            let _ = reply.send(Err(ModuleError::UnexpectedExit));
            return;
        }
        if self.machine.is_accessible() {
            if let Some(ready) = self.current.as_ref().filter(|ready| !ready.is_function()) {
                let actual = handle::json_type_name(ready.body.as_ref().unwrap_or(&Value::Null));
                let _ = reply.send(Err(ModuleError::TypeMismatch {
                    actual: actual.to_string(),
                }));
                return;
            }
        }

        let correlation_id = self.bridge.buffer(args, reply);
        tracing::trace!("Buffered invocation {}", correlation_id);
        if self.machine.is_running() {
            self.release();
        }
    }

    fn on_watch(&mut self, signal: WatchSignal) {
        match signal {
            WatchSignal::Ready => self.apply(Event::WatcherReady),
            WatchSignal::Changed => self.apply(Event::ModuleChanged),
            WatchSignal::Stopped => self.apply(Event::WatcherStopped),
        }
    }

    fn on_worker(&mut self, signal: WorkerSignal) {
        if signal.generation() != self.generation {
            tracing::debug!(
                "Ignoring signal from superseded worker generation {} (current {})",
                signal.generation(),
                self.generation
            );
            return;
        }

        match signal {
            WorkerSignal::Message { message, .. } => bridge::dispatch(message, self),
            WorkerSignal::Exited { crashed, .. } => {
                self.worker = None;
                let error = if self.machine.kill_requested() {
                    ModuleError::ExecutionOnKilledModule
                } else if crashed {
                    ModuleError::UnexpectedExit
                } else {
                    ModuleError::Restarted
                };
                let abandoned = self.bridge.abandon_in_flight(error);
                if abandoned > 0 {
                    tracing::debug!("{} in-flight invocation(s) lost with the worker", abandoned);
                }
                self.apply(Event::ProcessExited { crashed });
            }
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::StartWatcher => {
                let monitor = match self.watch_set.take() {
                    Some(set) if !self.config.disabled => {
                        WatchMonitor::start(set, self.config.debounce(), self.watch_tx.clone())
                    }
                    _ => WatchMonitor::inert(self.watch_tx.clone()),
                };
                self.monitor = Some(monitor);
            }
            Action::StopWatcher => match self.monitor.take() {
                Some(monitor) => {
                    tokio::spawn(monitor.close());
                }
                None => {
                    let _ = self.watch_tx.send(WatchSignal::Stopped);
                }
            },
            Action::SpawnWorker => self.spawn_worker(),
            Action::StopWorker => {
                if let Some(worker) = &self.worker {
                    worker.terminate();
                }
            }
            Action::ResolveHandle(ready) => {
                let module = if ready.is_function() {
                    Module::Function(self.proxy.clone())
                } else {
                    Module::Value(ready.body.clone().unwrap_or(Value::Null))
                };
                self.current = Some(ready);
                self.handle.resolve(module);
            }
            Action::RejectHandle(ModuleError::Unavailable) => {
                self.handle.reject_pending(ModuleError::Unavailable)
            }
            Action::RejectHandle(error) => self.handle.reject(error),
            Action::RecreateHandle => self.handle.recreate(),
            Action::FlushPending(ready) => {
                if ready.is_function() {
                    self.release();
                } else if self.bridge.has_buffered() {
                    self.logger.error(BUFFERED_DISCARDED_NOTICE);
                    self.bridge
                        .discard_all(ModuleError::BufferedInvocationDiscarded);
                }
            }
            Action::DiscardBuffered(error) => {
                self.bridge.discard_all(error);
            }
            Action::NotifyKilled => self.killed.cancel(),
            Action::LogReady => self.logger.info("Ready."),
            Action::LogRestarting => self.logger.info("Restarting.."),
            Action::LogFailed => self.logger.error("Exited unexpectedly"),
            Action::LogCannotRestart => self.logger.error("Module killed - cannot restart"),
        }
    }

    fn spawn_worker(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        match ManagedWorker::spawn(
            &self.config.worker,
            &self.config.path,
            generation,
            self.worker_tx.clone(),
        ) {
            Ok(worker) => self.worker = Some(worker),
            Err(e) => {
                self.logger.error(&format!("{:#}", e));
                let _ = self.worker_tx.send(WorkerSignal::Exited {
                    generation,
                    crashed: true,
                });
            }
        }
    }

    /// Send every buffered call to the live worker.
    fn release(&mut self) {
        let Some(worker) = self.worker.as_ref().filter(|w| w.phase() == WorkerPhase::Ready) else {
            return;
        };
        let released = self.bridge.release(|message| {
            if let Err(e) = worker.send(&message) {
                tracing::warn!("Failed to send invocation to worker: {}", e);
            }
        });
        if released > 0 {
            tracing::trace!(
                "Released {} invocation(s) to worker (pid: {}), {} in flight",
                released,
                worker.pid,
                self.bridge.in_flight_len()
            );
        }
    }
}

impl InboundHandler for Supervisor {
    fn on_module_ready(&mut self, ready: ModuleReady) {
        if let Some(worker) = self.worker.as_mut() {
            worker.mark_ready();
        }
        self.apply(Event::Ready(ready));
    }

    fn on_invocation_result(&mut self, correlation_id: CorrelationId, result: InvocationOutcome) {
        self.bridge.resolve(correlation_id, result);
    }
}
