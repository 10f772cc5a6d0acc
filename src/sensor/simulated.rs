use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::detect::SensorSample;
use crate::sensor::{SampleSink, SensorError, SensorRegistration, SensorSource};

const NOISE: f32 = 0.15;
const BUMP_MS: u64 = 200;
const BUMP_AMPLITUDE: f32 = 6.0;

/// Road noise with a short jolt every `bump_interval_ms`.
pub struct SimulatedGyro {
    rate_hz: u32,
    bump_interval_ms: u64,
    seed: Option<u64>,
}

impl SimulatedGyro {
    pub fn new(rate_hz: u32, bump_interval_ms: u64) -> Self {
        Self {
            rate_hz: rate_hz.max(1),
            bump_interval_ms,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn sample(rng: &mut StdRng, elapsed_ms: u64, bump_interval_ms: u64) -> SensorSample {
        let mut axis = || rng.gen_range(-NOISE..NOISE);
        let (mut x, mut y, z) = (axis(), axis(), axis());
        if bump_interval_ms > 0
            && elapsed_ms >= bump_interval_ms
            && elapsed_ms % bump_interval_ms < BUMP_MS
        {
            x += BUMP_AMPLITUDE;
            y -= BUMP_AMPLITUDE / 2.0;
        }
        SensorSample::new(x, y, z, elapsed_ms)
    }
}

impl SensorSource for SimulatedGyro {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn register(&self, sink: SampleSink) -> Result<SensorRegistration, SensorError> {
        let period = Duration::from_micros(1_000_000 / u64::from(self.rate_hz));
        let bump_interval_ms = self.bump_interval_ms;
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        info!(rate_hz = self.rate_hz, bump_interval_ms, "simulated gyroscope registered");
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let elapsed_ms = started.elapsed().as_millis() as u64;
                        sink(Self::sample(&mut rng, elapsed_ms, bump_interval_ms));
                    }
                }
            }
        });

        Ok(SensorRegistration::new(cancel, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_bump_window_is_loud() {
        let mut rng = StdRng::seed_from_u64(7);
        let calm = SimulatedGyro::sample(&mut rng, 1_000, 20_000);
        let bump = SimulatedGyro::sample(&mut rng, 20_050, 20_000);
        assert!(calm.magnitude() < 0.5);
        assert!(bump.magnitude() > 5.0);
        assert_eq!(bump.timestamp_ms, 20_050);
    }

    #[tokio::test]
    async fn test_delivers_until_unregistered() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: SampleSink = Arc::new(move |s| sink_seen.lock().unwrap().push(s));

        let reg = SimulatedGyro::new(200, 0).with_seed(1).register(sink).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        reg.unregister().await;

        let count = seen.lock().unwrap().len();
        assert!(count > 3, "only {count} samples delivered");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(seen.lock().unwrap().len(), count);
    }
}
