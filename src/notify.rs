use crate::accumulator::Calculations;
use crate::diagnosis::Alert;
use crate::frame::StructuredReading;
use serde::Serialize;
use tokio::sync::broadcast;

pub const NOTIFY_CAPACITY: usize = 256;

#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Structured(StructuredReading),
    /// no schema configured yet
    Flat(Vec<f64>),
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Measurement {
        timestamp: String,
        data: Payload,
        #[serde(skip_serializing_if = "Option::is_none")]
        calculations: Option<Calculations>,
    },
    Alert {
        alert: Alert,
    },
    Status {
        connected: bool,
        message: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Measurement { .. } => "measurement",
            Event::Alert { .. } => "alert",
            Event::Status { .. } => "status",
        }
    }
}

/// Fan-out of events to any number of subscribers.
/// A slow subscriber only loses its own backlog.
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Event>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn broadcast(&self, event: Event) {
        let name = event.name();
        //fails only when nobody listens
        if let Ok(n) = self.sender.send(event) {
            trace!("notify: {} event sent to {} subscriber(s)", name, n);
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Notifier::new(NOTIFY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DeviceReading, Value};

    #[test]
    fn events_are_tagged_json() {
        let event = Event::Status {
            connected: false,
            message: "port closed".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"type":"status","connected":false,"message":"port closed"}"#
        );

        let reading = StructuredReading {
            timestamp: "ts".to_string(),
            devices: vec![DeviceReading {
                device_id: "VD1".to_string(),
                fields: vec![("V".to_string(), Value::NotANumber)],
            }],
        };
        let event = Event::Measurement {
            timestamp: "ts".to_string(),
            data: Payload::Structured(reading),
            calculations: None,
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"type":"measurement","timestamp":"ts","data":{"VD1":{"V":"NaN"}}}"#
        );
    }

    #[test]
    fn broadcast_without_subscribers_is_fine() {
        let notifier = Notifier::new(4);
        notifier.broadcast(Event::Status {
            connected: true,
            message: String::new(),
        });
    }

    #[test]
    fn lagging_subscriber_does_not_affect_others() {
        let notifier = Notifier::new(2);
        let mut slow = notifier.subscribe();
        let mut fast = notifier.subscribe();
        for i in 0..3 {
            notifier.broadcast(Event::Status {
                connected: true,
                message: i.to_string(),
            });
            assert_eq!(fast.try_recv().unwrap().name(), "status");
        }
        assert!(matches!(
            slow.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(1))
        ));
        assert!(slow.try_recv().is_ok());
    }
}
