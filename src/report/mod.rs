//! Accumulates decoded readings into a most-recent-wins report and ships
//! it to an HTTP endpoint on a timer.

use chrono::{DateTime, Utc};
use log::*;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::sdr::framer::Packet;
use crate::wx::{self, Bucket, Reading};

/// A packet stamped with its receive time, as handed to the aggregator.
#[derive(Clone, Debug)]
pub struct Observation {
    pub packet: Packet,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WindDatum {
    pub speed: i16,
    pub direction: i16,
    pub battery_low: bool,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ValueDatum {
    pub value: f32,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RainRateDatum {
    pub inches_per_hour: f32,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct VoltageDatum {
    pub voltage: f32,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CounterDatum {
    pub count: u8,
    pub received_at: DateTime<Utc>,
}

/// The most recent reading of every sensor, each stamped with when it was
/// heard. Absent sensors serialize as `null`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct WeatherReport {
    pub temperature: Option<ValueDatum>,
    pub wind: Option<WindDatum>,
    pub rain: Option<RainRateDatum>,
    pub humidity: Option<ValueDatum>,
    pub battery: Option<VoltageDatum>,
    pub solar: Option<VoltageDatum>,
    pub uv: Option<ValueDatum>,
    pub solar_radiation: Option<ValueDatum>,
    pub rain_counter: Option<CounterDatum>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl WeatherReport {
    /// Fold one packet in. Wind rides on every transmission; the
    /// type-specific reading lands in its own slot. Sensor-absent packets
    /// leave the previous value in place.
    pub fn apply(&mut self, obs: &Observation, bucket: Bucket) {
        let at = obs.received_at;
        let pkt = &obs.packet;

        self.wind = Some(WindDatum {
            speed: pkt.wind_speed_mph() as i16,
            direction: pkt.wind_direction_deg(),
            battery_low: pkt.battery_low(),
            received_at: at,
        });

        match wx::decode(pkt, bucket) {
            Ok(Reading::TemperatureF(value)) => {
                self.temperature = Some(ValueDatum {
                    value,
                    received_at: at,
                })
            }
            Ok(Reading::Humidity(value)) => {
                self.humidity = Some(ValueDatum {
                    value,
                    received_at: at,
                })
            }
            Ok(Reading::RainRate(inches_per_hour)) => {
                self.rain = Some(RainRateDatum {
                    inches_per_hour,
                    received_at: at,
                })
            }
            Ok(Reading::SupercapVolts(voltage)) => {
                self.battery = Some(VoltageDatum {
                    voltage,
                    received_at: at,
                })
            }
            Ok(Reading::SolarVolts(voltage)) => {
                self.solar = Some(VoltageDatum {
                    voltage,
                    received_at: at,
                })
            }
            Ok(Reading::UvIndex(value)) => {
                self.uv = Some(ValueDatum {
                    value,
                    received_at: at,
                })
            }
            Ok(Reading::SolarRadiation(value)) => {
                self.solar_radiation = Some(ValueDatum {
                    value,
                    received_at: at,
                })
            }
            Ok(Reading::RainCount(count)) => {
                self.rain_counter = Some(CounterDatum {
                    count,
                    received_at: at,
                })
            }
            Ok(Reading::WindGust { mph, index }) => {
                debug!("gust {} mph (index {})", mph, index);
            }
            Err(e) => debug!("no reading from {}: {}", pkt, e),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.wind.is_none()
            && self.rain.is_none()
            && self.humidity.is_none()
            && self.battery.is_none()
            && self.solar.is_none()
            && self.uv.is_none()
            && self.solar_radiation.is_none()
            && self.rain_counter.is_none()
    }

    pub fn clear(&mut self) {
        *self = WeatherReport::default();
    }
}

pub struct SinkConfig {
    /// Empty string: log the report to stdout instead of POSTing.
    pub server_url: String,
    /// Sent as `x-api-key`; empty omits the header.
    pub api_key: String,
    pub interval: Duration,
    pub batch_size: usize,
    pub bucket: Bucket,
}

impl Default for SinkConfig {
    fn default() -> SinkConfig {
        SinkConfig {
            server_url: String::new(),
            api_key: String::new(),
            interval: Duration::from_secs(5),
            batch_size: 100,
            bucket: Bucket::In001,
        }
    }
}

/// Handle to the two background tasks: one folds observations into the
/// report, one delivers it on the interval.
pub struct Aggregator {
    tx: broadcast::Sender<Observation>,
    done: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Aggregator {
    pub fn start(cfg: SinkConfig) -> Aggregator {
        let (tx, rx) = broadcast::channel(cfg.batch_size.max(1));
        let (done, done_rx) = watch::channel(false);
        let report = Arc::new(Mutex::new(WeatherReport::default()));

        let sink = Sink {
            url: cfg.server_url,
            api_key: cfg.api_key,
            client: reqwest::Client::new(),
        };

        let tasks = vec![
            tokio::spawn(process_observations(
                rx,
                done_rx.clone(),
                report.clone(),
                cfg.bucket,
            )),
            tokio::spawn(deliver_periodically(sink, cfg.interval, done_rx, report)),
        ];

        Aggregator { tx, done, tasks }
    }

    /// Queue an observation. Never blocks: when the processing task falls
    /// behind, the channel discards its oldest entries instead of stalling
    /// the demodulator.
    pub fn add(&self, obs: Observation) {
        let _ = self.tx.send(obs);
    }

    /// Stop both tasks, delivering whatever the report holds first.
    pub async fn shutdown(self) {
        let _ = self.done.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn process_observations(
    mut rx: broadcast::Receiver<Observation>,
    mut done: watch::Receiver<bool>,
    report: Arc<Mutex<WeatherReport>>,
    bucket: Bucket,
) {
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(obs) => report.lock().await.apply(&obs, bucket),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("aggregator behind, dropped {} oldest readings", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = done.changed() => break,
        }
    }
}

async fn deliver_periodically(
    sink: Sink,
    interval: Duration,
    mut done: watch::Receiver<bool>,
    report: Arc<Mutex<WeatherReport>>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = timer.tick() => sink.deliver(&report).await,
            _ = done.changed() => {
                // final flush so a short run still delivers
                sink.deliver(&report).await;
                break;
            }
        }
    }
}

struct Sink {
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl Sink {
    // Holding the report lock across the POST is fine: delivery time is
    // small against the interval, and readings queue in the channel.
    async fn deliver(&self, report: &Mutex<WeatherReport>) {
        let mut report = report.lock().await;
        if report.is_empty() {
            return;
        }
        report.sent_at = Some(Utc::now());

        if self.url.is_empty() {
            match serde_json::to_string(&*report) {
                Ok(body) => {
                    info!("report: {}", body);
                    report.clear();
                }
                Err(e) => error!("cannot serialize report: {}", e),
            }
            return;
        }

        let mut request = self.client.post(self.url.as_str()).json(&*report);
        if !self.api_key.is_empty() {
            request = request.header("x-api-key", self.api_key.as_str());
        }
        match request.send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::CREATED => {
                debug!("report delivered");
                report.clear();
            }
            Ok(resp) => {
                warn!("sink returned {}, keeping report for retry", resp.status());
            }
            Err(e) => {
                warn!("sink unreachable ({}), keeping report for retry", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(data: [u8; 8]) -> Observation {
        Observation {
            packet: Packet {
                data,
                freq_error_hz: 0.0,
            },
            received_at: Utc::now(),
        }
    }

    #[test]
    fn wind_rides_on_every_packet() {
        let mut report = WeatherReport::default();
        assert!(report.is_empty());

        report.apply(&obs([0xA0, 0x06, 0x52, 0x83, 0x38, 0x00, 0x5A, 0xC8]), Bucket::In001);
        let wind = report.wind.as_ref().unwrap();
        assert_eq!(wind.speed, 6);
        assert_eq!(wind.direction, 116); // 0x52 = 82 raw
        assert!(report.humidity.is_some());
        assert!(report.temperature.is_none());
        assert!(!report.is_empty());
    }

    #[test]
    fn fields_keep_the_latest_reading() {
        let mut report = WeatherReport::default();
        report.apply(&obs([0x80, 0x00, 0x00, 0x33, 0x8D, 0x00, 0x25, 0x11]), Bucket::In001);
        let first = report.temperature.as_ref().unwrap().value;
        assert!((first - 82.4).abs() < 1e-3);

        // a later temperature overwrites, a humidity packet does not
        report.apply(&obs([0x80, 0x00, 0x00, 0x20, 0x0D, 0x00, 0x00, 0x00]), Bucket::In001);
        let second = report.temperature.as_ref().unwrap().value;
        assert!((second - 51.2).abs() < 1e-3, "{}", second);

        report.apply(&obs([0xA0, 0x06, 0x52, 0x83, 0x38, 0x00, 0x5A, 0xC8]), Bucket::In001);
        assert!((report.temperature.as_ref().unwrap().value - 51.2).abs() < 1e-3);
    }

    #[test]
    fn sensor_absent_preserves_previous_value() {
        let mut report = WeatherReport::default();
        report.apply(&obs([0x80, 0x00, 0x00, 0x33, 0x8D, 0x00, 0x25, 0x11]), Bucket::In001);
        // same station later reports no temperature sensor
        report.apply(&obs([0x80, 0x00, 0xDB, 0xFF, 0xC8, 0x00, 0xAB, 0xF8]), Bucket::In001);
        let t = report.temperature.as_ref().unwrap().value;
        assert!((t - 82.4).abs() < 1e-3);
    }

    #[test]
    fn clear_resets_everything() {
        let mut report = WeatherReport::default();
        report.apply(&obs([0xA0, 0x06, 0x52, 0x83, 0x38, 0x00, 0x5A, 0xC8]), Bucket::In001);
        report.sent_at = Some(Utc::now());
        report.clear();
        assert!(report.is_empty());
        assert!(report.sent_at.is_none());
    }

    #[test]
    fn serializes_with_null_for_absent_fields() {
        let mut report = WeatherReport::default();
        report.apply(&obs([0xA0, 0x06, 0x52, 0x83, 0x38, 0x00, 0x5A, 0xC8]), Bucket::In001);

        let v: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert!(v["temperature"].is_null());
        assert!(v["sent_at"].is_null());
        assert!((v["humidity"]["value"].as_f64().unwrap() - 89.9).abs() < 1e-3);
        assert_eq!(v["wind"]["speed"].as_i64().unwrap(), 6);
        assert!(v["wind"]["received_at"].is_string());
    }

    #[tokio::test]
    async fn aggregator_drains_and_shuts_down() {
        let aggregator = Aggregator::start(SinkConfig::default());
        aggregator.add(obs([0xA0, 0x06, 0x52, 0x83, 0x38, 0x00, 0x5A, 0xC8]));
        // shutdown flushes the partial report to the log sink and joins
        aggregator.shutdown().await;
    }
}
