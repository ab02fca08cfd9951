use failure::Fail;
use log::*;
use std::time::{Duration, Instant};

use super::plan::ChannelPlan;
use crate::sdr::framer::Packet;

pub const MAX_STATIONS: usize = 8;

// One transmitter tick of slack after the predicted arrival.
const HOP_SLACK: Duration = Duration::from_micros(62_500);
const BASE_PERIOD: Duration = Duration::from_micros(2_562_500);
const PERIOD_STEP: Duration = Duration::from_micros(62_500);

// Smoothing factor for the per-channel carrier error average.
const AFC_SMOOTHING: f32 = 0.25;

/// Nominal interval between two visits of station `id` to consecutive
/// channels. Higher ids rotate slower so colocated stations drift apart
/// instead of colliding forever.
pub fn loop_period(id: u8) -> Duration {
    BASE_PERIOD + PERIOD_STEP * id as u32
}

/// A retune request for the radio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HopEvent {
    pub channel_idx: usize,
    pub freq_hz: u32,
    pub freq_correction_hz: i32,
}

/// What the driver does after a tracker transition: tune to `hop` and call
/// [`HopTracker::timeout`] if nothing arrives by `deadline`.
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub hop: HopEvent,
    pub deadline: Instant,
}

pub struct TrackerConfig {
    /// Bit i selects station id i.
    pub active_mask: u8,
    /// Consecutive misses tolerated before a full resync.
    pub max_missed: u32,
    pub receive_window: Duration,
    /// Extra slack added on top of the receive window.
    pub extra: Duration,
    pub afc: bool,
}

impl Default for TrackerConfig {
    fn default() -> TrackerConfig {
        TrackerConfig {
            active_mask: 1,
            max_missed: 51,
            receive_window: Duration::from_millis(300),
            extra: Duration::from_millis(0),
            afc: true,
        }
    }
}

#[derive(Debug, Fail)]
#[fail(display = "transmitter mask selects no station")]
pub struct EmptyMask;

#[derive(Debug)]
pub enum PacketOutcome {
    /// Same raw bytes as the previous packet; state untouched.
    Duplicate,
    /// Station id outside the active set.
    Undefined(u8),
    /// Tracked station. `step` is present whenever the radio should move.
    Accepted { id: u8, step: Option<Step> },
}

struct Station {
    id: u8,
    period: Duration,
    last_visit: Option<Instant>,
    last_seq: usize,
    next_visit: Option<Instant>,
    next_seq: usize,
    alarm_count: u32,
    total_seen: u64,
    missed_per_slot: Vec<u32>,
    freq_err: Vec<Option<f32>>,
}

impl Station {
    fn new(id: u8, channels: usize) -> Station {
        Station {
            id,
            period: loop_period(id),
            last_visit: None,
            last_seq: 0,
            next_visit: None,
            next_seq: 0,
            alarm_count: 0,
            total_seen: 0,
            missed_per_slot: vec![0; channels],
            freq_err: vec![None; channels],
        }
    }

    fn observe_freq_error(&mut self, slot: usize, err_hz: f32) {
        let ema = &mut self.freq_err[slot];
        *ema = Some(match *ema {
            Some(prev) => prev + AFC_SMOOTHING * (err_hz - prev),
            None => err_hz,
        });
    }
}

/// Keeps the radio parked where the next tracked transmitter will show up.
///
/// The tracker is a plain state machine: every input carries an explicit
/// `now`, every transition returns what the radio should do next, and the
/// caller owns the clock and the timer. Tests drive it with synthetic
/// instants.
pub struct HopTracker {
    plan: ChannelPlan,
    cfg: TrackerConfig,
    stations: Vec<Station>,
    index_of_id: [Option<usize>; MAX_STATIONS],
    undefined: [u64; MAX_STATIONS],
    expected: usize,
    init_pending: bool,
    seen_during_init: usize,
    resyncs: u64,
    current_slot: usize,
    last_bytes: Option<[u8; 8]>,
}

impl HopTracker {
    pub fn new(plan: ChannelPlan, cfg: TrackerConfig) -> Result<HopTracker, EmptyMask> {
        let mut stations = Vec::new();
        let mut index_of_id = [None; MAX_STATIONS];
        for id in 0..MAX_STATIONS as u8 {
            if cfg.active_mask & (1 << id) != 0 {
                index_of_id[id as usize] = Some(stations.len());
                stations.push(Station::new(id, plan.count()));
            }
        }
        if stations.is_empty() {
            return Err(EmptyMask);
        }

        Ok(HopTracker {
            plan,
            cfg,
            stations,
            index_of_id,
            undefined: [0; MAX_STATIONS],
            expected: 0,
            init_pending: true,
            seen_during_init: 0,
            resyncs: 0,
            current_slot: 0,
            last_bytes: None,
        })
    }

    pub fn plan(&self) -> &ChannelPlan {
        &self.plan
    }

    /// Begin (or restart) synchronization: park on the pattern's first
    /// channel and wait long enough for every station to complete a full
    /// rotation past it.
    pub fn start(&mut self, now: Instant) -> Step {
        self.init_pending = true;
        self.seen_during_init = 0;
        for st in &mut self.stations {
            st.last_visit = None;
        }
        let slot = self.plan.seq_to_hop(0);
        self.current_slot = slot;
        let deadline = now + self.init_deadline();
        info!(
            "init: waiting up to {}s for a packet from each of {} stations",
            self.init_deadline().as_secs(),
            self.stations.len()
        );
        Step {
            hop: self.hop_event(self.expected, slot),
            deadline,
        }
    }

    /// A CRC-valid packet arrived while parked on the current channel.
    pub fn packet(&mut self, now: Instant, pkt: &Packet) -> PacketOutcome {
        if self.last_bytes == Some(pkt.data) {
            debug!("duplicate packet: {}", pkt);
            return PacketOutcome::Duplicate;
        }
        self.last_bytes = Some(pkt.data);

        let id = pkt.station_id();
        let index = match self.index_of_id[id as usize] {
            Some(i) => i,
            None => {
                self.undefined[id as usize] += 1;
                return PacketOutcome::Undefined(id);
            }
        };

        let slot = self.current_slot;
        let anchor_seq = self.plan.hop_to_seq(slot);
        let station_count = self.stations.len();

        let st = &mut self.stations[index];
        st.total_seen += 1;
        st.alarm_count = 0;
        st.observe_freq_error(slot, pkt.freq_error_hz);

        if self.init_pending {
            if st.last_visit.is_none() {
                st.last_visit = Some(now);
                st.last_seq = anchor_seq;
                self.seen_during_init += 1;
                info!("transmitter {} seen", id);
                if self.seen_during_init == station_count {
                    if station_count > 1 {
                        info!("all transmitters seen");
                    }
                    self.init_pending = false;
                    let step = self.advance(now);
                    return PacketOutcome::Accepted {
                        id,
                        step: Some(step),
                    };
                }
            } else {
                // refine the anchor; the station is back on this channel
                // after whole rotations, so the sequence stays valid
                st.last_visit = Some(now);
            }
            PacketOutcome::Accepted { id, step: None }
        } else {
            st.last_visit = Some(now);
            st.last_seq = anchor_seq;
            let step = self.advance(now);
            PacketOutcome::Accepted {
                id,
                step: Some(step),
            }
        }
    }

    /// The receive window closed with nothing decoded.
    pub fn timeout(&mut self, now: Instant) -> Step {
        if self.init_pending {
            // a whole rotation of silence; start the wait over
            self.resyncs += 1;
            return self.start(now);
        }

        let st = &mut self.stations[self.expected];
        // pretend the packet was received so the schedule stays anchored
        st.last_visit = Some(st.last_visit.unwrap_or(now) + st.period);
        st.last_seq = (st.last_seq + 1) % self.plan.count();
        st.alarm_count += 1;
        st.missed_per_slot[self.current_slot] += 1;
        info!(
            "id {}: packet missed ({}), missed on slot {}: {}",
            st.id, st.alarm_count, self.current_slot, st.missed_per_slot[self.current_slot]
        );

        let max_missed = self.cfg.max_missed;
        let mut lost = false;
        for st in &mut self.stations {
            if st.alarm_count > max_missed {
                st.alarm_count = 0;
                lost = true;
            }
        }
        if lost {
            warn!("synchronization lost, resyncing");
            self.resyncs += 1;
            return self.start(now);
        }
        self.advance(now)
    }

    /// Roll every station's schedule forward past `now`, pick the earliest
    /// arrival, and point the radio at its channel.
    fn advance(&mut self, now: Instant) -> Step {
        let max_freq = self.plan.count();

        let mut expected = 0usize;
        let mut earliest: Option<Instant> = None;
        for (i, st) in self.stations.iter_mut().enumerate() {
            let mut visit = match st.last_visit {
                Some(v) => v,
                None => {
                    // cannot happen once init completes; repair and carry on
                    error!("station {} has no visit anchor", st.id);
                    st.last_visit = Some(now);
                    now
                }
            };
            let mut seq = st.last_seq;
            while visit <= now {
                visit += st.period;
                seq = (seq + 1) % max_freq;
            }
            st.next_visit = Some(visit);
            st.next_seq = seq;
            if earliest.map_or(true, |e| visit < e) {
                earliest = Some(visit);
                expected = i;
            }
        }

        self.expected = expected;
        let st = &self.stations[expected];
        let slot = self.plan.seq_to_hop(st.next_seq);
        self.current_slot = slot;
        let deadline =
            earliest.unwrap_or(now) + HOP_SLACK + self.cfg.receive_window + self.cfg.extra;
        debug!(
            "expecting id {} on slot {} (seq {})",
            st.id, slot, st.next_seq
        );
        Step {
            hop: self.hop_event(expected, slot),
            deadline,
        }
    }

    fn hop_event(&self, station: usize, slot: usize) -> HopEvent {
        let freq_correction_hz = if self.cfg.afc {
            self.stations[station].freq_err[slot]
                .map(|e| e.round() as i32)
                .unwrap_or(0)
        } else {
            0
        };
        HopEvent {
            channel_idx: slot,
            freq_hz: self.plan.freq(slot),
            freq_correction_hz,
        }
    }

    fn init_deadline(&self) -> Duration {
        let slowest = self
            .stations
            .last()
            .map(|st| st.period)
            .unwrap_or_else(|| loop_period(0));
        (self.plan.count() as u32 + 2) * slowest
    }

    // Introspection, used by the driver's status lines and by tests.

    pub fn init_pending(&self) -> bool {
        self.init_pending
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    pub fn expected_id(&self) -> u8 {
        self.stations[self.expected].id
    }

    pub fn undefined_seen(&self, id: u8) -> u64 {
        self.undefined[id as usize & 0x07]
    }

    fn station(&self, id: u8) -> Option<&Station> {
        self.index_of_id[id as usize & 0x07].map(|i| &self.stations[i])
    }

    pub fn alarm_count(&self, id: u8) -> Option<u32> {
        self.station(id).map(|st| st.alarm_count)
    }

    pub fn total_seen(&self, id: u8) -> Option<u64> {
        self.station(id).map(|st| st.total_seen)
    }

    pub fn missed(&self, id: u8, slot: usize) -> Option<u32> {
        self.station(id).map(|st| st.missed_per_slot[slot])
    }

    pub fn last_visit(&self, id: u8) -> Option<Instant> {
        self.station(id).and_then(|st| st.last_visit)
    }

    pub fn freq_correction(&self, id: u8, slot: usize) -> Option<f32> {
        self.station(id).and_then(|st| st.freq_err[slot])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hop::plan::Region;

    fn pkt(data: [u8; 8]) -> Packet {
        Packet {
            data,
            freq_error_hz: 0.0,
        }
    }

    // two distinct captured packets from station id 0
    const P0A: [u8; 8] = [0x80, 0x00, 0x00, 0x33, 0x8D, 0x00, 0x25, 0x11];
    const P0B: [u8; 8] = [0xA0, 0x06, 0x52, 0x83, 0x38, 0x00, 0x5A, 0xC8];
    // station id 1
    const P1A: [u8; 8] = [0x81, 0x00, 0x00, 0x59, 0x45, 0x00, 0xA3, 0xE6];

    fn tracker(mask: u8, max_missed: u32) -> HopTracker {
        let cfg = TrackerConfig {
            active_mask: mask,
            max_missed,
            ..TrackerConfig::default()
        };
        HopTracker::new(ChannelPlan::new(Region::Us), cfg).unwrap()
    }

    #[test]
    fn loop_periods_ascend_in_62500us_steps() {
        assert_eq!(loop_period(0), Duration::from_micros(2_562_500));
        for id in 1..8 {
            assert_eq!(
                loop_period(id) - loop_period(id - 1),
                Duration::from_micros(62_500)
            );
        }
    }

    #[test]
    fn init_parks_on_first_pattern_slot() {
        let mut tr = tracker(1, 51);
        let t0 = Instant::now();
        let step = tr.start(t0);
        assert_eq!(step.hop.channel_idx, 0);
        assert!(tr.init_pending());
        // (51 + 2) rotations of the only (and thus slowest) station
        assert_eq!(step.deadline, t0 + 53 * loop_period(0));
    }

    #[test]
    fn single_station_predicts_next_slots() {
        let mut tr = tracker(1, 51);
        let t0 = Instant::now();
        tr.start(t0);

        // first observation: sync completes, radio moves to seq 1
        let step = match tr.packet(t0, &pkt(P0A)) {
            PacketOutcome::Accepted { id: 0, step: Some(s) } => s,
            other => panic!("{:?}", other),
        };
        assert!(!tr.init_pending());
        let plan = ChannelPlan::new(Region::Us);
        assert_eq!(step.hop.channel_idx, plan.seq_to_hop(1));
        assert_eq!(
            step.deadline,
            t0 + loop_period(0)
                + Duration::from_micros(62_500)
                + Duration::from_millis(300)
        );

        // window closes empty: one miss, prediction rolls to seq 2
        let step = tr.timeout(step.deadline);
        assert_eq!(step.hop.channel_idx, plan.seq_to_hop(2));
        assert_eq!(tr.alarm_count(0), Some(1));
        assert_eq!(tr.missed(0, plan.seq_to_hop(1)), Some(1));
    }

    #[test]
    fn missed_packet_ledger_accumulates() {
        let mut tr = tracker(1, 51);
        let t0 = Instant::now();
        tr.start(t0);
        let mut step = match tr.packet(t0, &pkt(P0A)) {
            PacketOutcome::Accepted { step: Some(s), .. } => s,
            other => panic!("{:?}", other),
        };

        let k = 5;
        for _ in 0..k {
            step = tr.timeout(step.deadline);
        }
        assert_eq!(tr.alarm_count(0), Some(k));
        let plan = ChannelPlan::new(Region::Us);
        let total: u32 = (0..plan.count()).map(|s| tr.missed(0, s).unwrap()).sum();
        assert_eq!(total, k);
    }

    #[test]
    fn sync_loss_triggers_exactly_one_resync() {
        let mut tr = tracker(1, 3);
        let t0 = Instant::now();
        tr.start(t0);
        let mut step = match tr.packet(t0, &pkt(P0A)) {
            PacketOutcome::Accepted { step: Some(s), .. } => s,
            other => panic!("{:?}", other),
        };

        let mut transitions = 0;
        let mut was_pending = tr.init_pending();
        for _ in 0..5 {
            step = tr.timeout(step.deadline);
            if tr.init_pending() && !was_pending {
                transitions += 1;
                // the resync retunes to the pattern's first slot
                assert_eq!(step.hop.channel_idx, 0);
                assert_eq!(tr.last_visit(0), None);
            }
            was_pending = tr.init_pending();
        }
        assert_eq!(transitions, 1);
        assert!(tr.init_pending());
    }

    #[test]
    fn duplicate_bytes_update_state_once() {
        let mut tr = tracker(1, 51);
        let t0 = Instant::now();
        tr.start(t0);
        match tr.packet(t0, &pkt(P0A)) {
            PacketOutcome::Accepted { .. } => {}
            other => panic!("{:?}", other),
        }
        match tr.packet(t0 + Duration::from_millis(2), &pkt(P0A)) {
            PacketOutcome::Duplicate => {}
            other => panic!("{:?}", other),
        }
        assert_eq!(tr.total_seen(0), Some(1));
    }

    #[test]
    fn undefined_station_is_counted_not_tracked() {
        let mut tr = tracker(1, 51);
        let t0 = Instant::now();
        tr.start(t0);
        match tr.packet(t0, &pkt(P1A)) {
            PacketOutcome::Undefined(1) => {}
            other => panic!("{:?}", other),
        }
        assert_eq!(tr.undefined_seen(1), 1);
        assert!(tr.init_pending());
    }

    #[test]
    fn init_waits_for_every_station() {
        let mut tr = tracker(0b11, 51);
        let t0 = Instant::now();
        tr.start(t0);

        match tr.packet(t0, &pkt(P0A)) {
            PacketOutcome::Accepted { id: 0, step: None } => {}
            other => panic!("{:?}", other),
        }
        assert!(tr.init_pending());

        // a second sighting of the same station refines the anchor only
        let t1 = t0 + 53 * loop_period(0) / 2;
        match tr.packet(t1, &pkt(P0B)) {
            PacketOutcome::Accepted { id: 0, step: None } => {}
            other => panic!("{:?}", other),
        }
        assert_eq!(tr.last_visit(0), Some(t1));
        assert_eq!(tr.total_seen(0), Some(2));

        let t2 = t1 + Duration::from_millis(500);
        let step = match tr.packet(t2, &pkt(P1A)) {
            PacketOutcome::Accepted { id: 1, step: Some(s) } => s,
            other => panic!("{:?}", other),
        };
        assert!(!tr.init_pending());
        // both anchors sit in the past; the prediction must be in the future
        assert!(step.deadline > t2);
    }

    #[test]
    fn afc_smoothes_per_channel_error() {
        // keep init pending with a two-station mask so the radio stays on
        // slot 0 while both observations land
        let mut tr = tracker(0b11, 51);
        let t0 = Instant::now();
        tr.start(t0);

        let mut a = pkt(P0A);
        a.freq_error_hz = 1000.0;
        tr.packet(t0, &a);
        let mut b = pkt(P0B);
        b.freq_error_hz = 2000.0;
        tr.packet(t0 + Duration::from_secs(3), &b);

        assert_eq!(tr.freq_correction(0, 0), Some(1250.0));
        assert_eq!(tr.freq_correction(0, 19), None);
    }

    #[test]
    fn noafc_zeroes_every_correction() {
        let cfg = TrackerConfig {
            active_mask: 1,
            afc: false,
            ..TrackerConfig::default()
        };
        let mut tr = HopTracker::new(ChannelPlan::new(Region::Us), cfg).unwrap();
        let t0 = Instant::now();
        let step = tr.start(t0);
        assert_eq!(step.hop.freq_correction_hz, 0);

        let mut a = pkt(P0A);
        a.freq_error_hz = 5000.0;
        let step = match tr.packet(t0, &a) {
            PacketOutcome::Accepted { step: Some(s), .. } => s,
            other => panic!("{:?}", other),
        };
        assert_eq!(step.hop.freq_correction_hz, 0);
        let step = tr.timeout(step.deadline);
        assert_eq!(step.hop.freq_correction_hz, 0);
    }

    #[test]
    fn predictions_stay_phase_locked() {
        let mut tr = tracker(1, 51);
        let t0 = Instant::now();
        tr.start(t0);
        let mut step = match tr.packet(t0, &pkt(P0A)) {
            PacketOutcome::Accepted { step: Some(s), .. } => s,
            other => panic!("{:?}", other),
        };
        // every deadline is one loop period after the previous one
        for _ in 0..4 {
            let next = tr.timeout(step.deadline);
            assert_eq!(next.deadline - step.deadline, loop_period(0));
            step = next;
        }
    }
}
