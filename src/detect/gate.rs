use tracing::debug;

use crate::detect::{AnomalyEvent, TriggerEvent};

/// Converts per-sample detections into at most one trigger per cooldown.
///
/// Not edge-triggered: while input stays anomalous the gate fires again as
/// soon as the cooldown since the last emission has elapsed. Detections
/// inside the cooldown are dropped, not deferred.
#[derive(Debug, Clone)]
pub struct DebouncedGate {
    cooldown_ms: u64,
    last_emission_ms: Option<u64>,
}

impl DebouncedGate {
    pub fn new(cooldown_ms: u64) -> Self {
        Self {
            cooldown_ms,
            last_emission_ms: None,
        }
    }

    pub fn cooldown_ms(&self) -> u64 {
        self.cooldown_ms
    }

    pub fn last_emission_ms(&self) -> Option<u64> {
        self.last_emission_ms
    }

    pub fn on_evaluation(&mut self, event: &AnomalyEvent) -> Option<TriggerEvent> {
        if !event.detected {
            return None;
        }

        let now = event.timestamp_ms;
        if let Some(last) = self.last_emission_ms {
            // saturating: a timestamp that goes backwards stays in cooldown
            if now.saturating_sub(last) < self.cooldown_ms {
                debug!(
                    now,
                    last,
                    cooldown_ms = self.cooldown_ms,
                    "detection suppressed by cooldown"
                );
                return None;
            }
        }

        self.last_emission_ms = Some(now);
        Some(TriggerEvent::detected(now))
    }

    pub fn reset(&mut self) {
        self.last_emission_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detected_at(t: u64) -> AnomalyEvent {
        AnomalyEvent {
            timestamp_ms: t,
            detected: true,
            ..AnomalyEvent::default()
        }
    }

    #[test]
    fn test_sustained_detection_fires_once_per_cooldown() {
        let mut gate = DebouncedGate::new(5_000);
        let emitted: Vec<u64> = (0..=10)
            .map(|s| s * 1_000)
            .filter_map(|t| gate.on_evaluation(&detected_at(t)))
            .map(|e| e.timestamp_ms)
            .collect();
        assert_eq!(emitted, vec![0, 5_000, 10_000]);
    }

    #[test]
    fn test_not_detected_never_emits() {
        let mut gate = DebouncedGate::new(0);
        let ev = AnomalyEvent { timestamp_ms: 1, ..AnomalyEvent::default() };
        assert!(gate.on_evaluation(&ev).is_none());
        assert_eq!(gate.last_emission_ms(), None);
    }

    #[test]
    fn test_suppressed_detection_does_not_extend_cooldown() {
        let mut gate = DebouncedGate::new(5_000);
        assert!(gate.on_evaluation(&detected_at(1_000)).is_some());
        assert!(gate.on_evaluation(&detected_at(5_999)).is_none());
        // Cooldown counts from the emission at 1000, not the suppressed hit.
        assert!(gate.on_evaluation(&detected_at(6_000)).is_some());
    }

    #[test]
    fn test_backwards_timestamp_stays_suppressed() {
        let mut gate = DebouncedGate::new(5_000);
        assert!(gate.on_evaluation(&detected_at(10_000)).is_some());
        assert!(gate.on_evaluation(&detected_at(2_000)).is_none());
    }
}
