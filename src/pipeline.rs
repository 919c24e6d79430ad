use crate::accumulator::{self, AccumulatorState, Calculations};
use crate::alerts::AlertManager;
use crate::config::{DiagnosisSettings, Settings};
use crate::database::{Granularity, HistoryPoint, Measurement, Store};
use crate::diagnosis::{self, Alert, ReferenceReading};
use crate::frame::{Frame, StructuredReading};
use crate::notify::{Event, Notifier, Payload};
use crate::serial::CommandResult;
use chrono::{Local, NaiveDateTime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

pub type Reply<T> = oneshot::Sender<T>;

pub enum PipelineTask {
    /// line read from the controller
    Line(String),
    /// line submitted for simulation, answered with the resulting message
    Inject {
        line: String,
        reply: Reply<Option<Event>>,
    },
    ListAlerts {
        limit: usize,
        active_only: bool,
        reply: Reply<Result<Vec<Alert>, String>>,
    },
    Acknowledge {
        id: i64,
        reply: Reply<CommandResult>,
    },
    Delete {
        id: i64,
        reply: Reply<CommandResult>,
    },
    History {
        start: NaiveDateTime,
        end: NaiveDateTime,
        granularity: Granularity,
        reply: Reply<Result<Vec<HistoryPoint>, String>>,
    },
    Reload {
        reply: Reply<CommandResult>,
    },
    SetDiagnosis {
        settings: DiagnosisSettings,
        reply: Reply<CommandResult>,
    },
    ConfigLines {
        reply: Reply<Vec<String>>,
    },
}

/// Owns all mutable processing state; lines are handled strictly one at a time
pub struct Pipeline {
    pub name: String,
    pub config_path: String,
    pub settings: Settings,
    pub state: AccumulatorState,
    pub alerts: AlertManager,
    pub store: Box<dyn Store>,
    pub notifier: Notifier,
    pub receiver: Receiver<PipelineTask>,
}

impl Pipeline {
    pub fn new(
        name: &str,
        config_path: &str,
        settings: Settings,
        store: Box<dyn Store>,
        notifier: Notifier,
        receiver: Receiver<PipelineTask>,
    ) -> Self {
        Self {
            name: name.to_string(),
            config_path: config_path.to_string(),
            settings,
            state: AccumulatorState::default(),
            alerts: AlertManager::new("alerts"),
            store,
            notifier,
            receiver,
        }
    }

    /// One full cycle for a single line. Returns None when the line carries no data.
    pub fn process_line(&mut self, line: &str, now: NaiveDateTime) -> Option<Event> {
        let frame = match Frame::parse(line, &self.settings.schema) {
            Some(frame) => frame,
            None => {
                debug!("{}: no data in line: {:?}", self.name, line);
                return None;
            }
        };

        match frame {
            Frame::Flat { timestamp, values } => {
                debug!("{}: flat frame with {} values (no schema)", self.name, values.len());
                let event = Event::Measurement {
                    timestamp,
                    data: Payload::Flat(values),
                    calculations: None,
                };
                self.notifier.broadcast(event.clone());
                Some(event)
            }
            Frame::Structured(reading) => Some(self.process_reading(reading, now)),
        }
    }

    fn process_reading(&mut self, reading: StructuredReading, now: NaiveDateTime) -> Event {
        trace!("{}: {}", self.name, reading);
        let calculations =
            accumulator::calculate(&mut self.state, &reading, &self.settings.topology, now);
        self.persist(&reading, &calculations, reading.instant().unwrap_or(now));

        let mut created = vec![];
        if self.settings.diagnosis.enabled {
            let reference = reading
                .device(&self.settings.reference_device)
                .map(ReferenceReading::from_device);
            let candidates = diagnosis::analyze(
                &reading,
                Some(&calculations),
                reference.as_ref(),
                &self.settings.thresholds,
                &self.settings.topology,
                now,
            );
            let outcome = self
                .alerts
                .reconcile(candidates, self.store.as_mut(), now);
            if !outcome.created.is_empty() || !outcome.resolved.is_empty() {
                info!(
                    "{}: {} new alert(s), {} resolved, {} active",
                    self.name,
                    outcome.created.len(),
                    outcome.resolved.len(),
                    self.alerts.active_count()
                );
            }
            created = outcome.created;
        }

        let event = Event::Measurement {
            timestamp: reading.timestamp.clone(),
            data: Payload::Structured(reading),
            calculations: Some(calculations),
        };
        self.notifier.broadcast(event.clone());
        if self.settings.diagnosis.notifications {
            for alert in created {
                self.notifier.broadcast(Event::Alert { alert });
            }
        }
        event
    }

    fn persist(&mut self, reading: &StructuredReading, calc: &Calculations, ts: NaiveDateTime) {
        let measurements: Vec<Measurement> = reading
            .devices
            .iter()
            .flat_map(|device| {
                device.fields.iter().filter_map(move |(field, value)| {
                    value.as_number().map(|value| Measurement {
                        device_id: device.device_id.clone(),
                        field: field.clone(),
                        value,
                    })
                })
            })
            .collect();
        if let Err(e) = self.store.insert_cycle(ts, &measurements, calc) {
            error!(
                "{}: cannot store cycle ({} measurements), nothing written: {}",
                self.name,
                measurements.len(),
                e
            );
        }
    }

    fn reload(&mut self) -> CommandResult {
        match Settings::load(&self.config_path) {
            Ok(settings) => {
                info!(
                    "{}: configuration reloaded: {} schema entries, {} assignment points",
                    self.name,
                    settings.schema.entries().len(),
                    settings.topology.assignments().len()
                );
                if settings.postgres != self.settings.postgres {
                    warn!("{}: database settings change needs a restart", self.name);
                }
                self.settings = settings;
                CommandResult::ok("configuration reloaded")
            }
            Err(e) => {
                error!("{}: cannot reload {:?}: {}", self.name, self.config_path, e);
                CommandResult::failed(&format!("cannot reload configuration: {}", e))
            }
        }
    }

    pub fn handle(&mut self, task: PipelineTask) {
        let now = Local::now().naive_local();
        match task {
            PipelineTask::Line(line) => {
                self.process_line(&line, now);
            }
            PipelineTask::Inject { line, reply } => {
                info!("{}: injected line: {:?}", self.name, line);
                let _ = reply.send(self.process_line(&line, now));
            }
            PipelineTask::ListAlerts {
                limit,
                active_only,
                reply,
            } => {
                let result = self
                    .store
                    .list_alerts(limit, active_only)
                    .map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            PipelineTask::Acknowledge { id, reply } => {
                let result = match self.alerts.acknowledge(id, self.store.as_mut(), now) {
                    Ok(()) => CommandResult::ok(&format!("alert {} acknowledged", id)),
                    Err(e) => CommandResult::failed(&e.to_string()),
                };
                let _ = reply.send(result);
            }
            PipelineTask::Delete { id, reply } => {
                let result = match self.alerts.delete(id, self.store.as_mut(), now) {
                    Ok(()) => CommandResult::ok(&format!("alert {} deleted", id)),
                    Err(e) => CommandResult::failed(&e.to_string()),
                };
                let _ = reply.send(result);
            }
            PipelineTask::History {
                start,
                end,
                granularity,
                reply,
            } => {
                let result = self
                    .store
                    .history(start, end, granularity)
                    .map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            PipelineTask::Reload { reply } => {
                let _ = reply.send(self.reload());
            }
            PipelineTask::SetDiagnosis { settings, reply } => {
                info!(
                    "{}: diagnosis enabled: {}, notifications: {}",
                    self.name, settings.enabled, settings.notifications
                );
                self.settings.diagnosis = settings;
                let _ = reply.send(CommandResult::ok("diagnosis settings updated"));
            }
            PipelineTask::ConfigLines { reply } => {
                let lines = self
                    .settings
                    .schema
                    .to_config_lines(self.settings.serial.delay);
                let _ = reply.send(lines);
            }
        }
    }

    pub fn worker(&mut self, worker_cancel_flag: Arc<AtomicBool>) {
        info!("{}: Starting thread", self.name);
        loop {
            if worker_cancel_flag.load(Ordering::SeqCst) {
                debug!("{}: Got terminate signal from main", self.name);
                break;
            }

            match self.receiver.recv_timeout(Duration::from_millis(50)) {
                Ok(task) => self.handle(task),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("{}: all task senders are gone", self.name);
                    break;
                }
            }
        }
        info!("{}: thread stopped", self.name);
    }
}
