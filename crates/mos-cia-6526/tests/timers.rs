//! CIA timer, interrupt and time-of-day behaviour driven through a scheduler.

use emu_core::{EventHandler, EventScheduler, Observable, Phase, SchedulerError, Value};
use mos_cia_6526::{Cia, CiaEvent, CiaModel, CiaPorts};

const TAL: u8 = 0x04;
const TAH: u8 = 0x05;
const TBL: u8 = 0x06;
const TBH: u8 = 0x07;
const TOD_TEN: u8 = 0x08;
const TOD_SEC: u8 = 0x09;
const TOD_MIN: u8 = 0x0A;
const TOD_HR: u8 = 0x0B;
const SDR: u8 = 0x0C;
const ICR: u8 = 0x0D;
const CRA: u8 = 0x0E;
const CRB: u8 = 0x0F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RigEvent {
    Cia(CiaEvent),
    /// CPU acknowledging the interrupt by reading the ICR.
    Ack,
}

#[derive(Default)]
struct Pins {
    irq: bool,
    port_a: Option<u8>,
}

impl CiaPorts for Pins {
    fn interrupt(&mut self, asserted: bool) {
        self.irq = asserted;
    }

    fn write_port_a(&mut self, value: u8) -> Result<(), SchedulerError> {
        self.port_a = Some(value);
        Ok(())
    }
}

struct Board {
    cia: Cia<RigEvent>,
    pins: Pins,
    acks: Vec<(u64, u8)>,
    auto_ack: bool,
}

impl EventHandler<RigEvent> for Board {
    fn handle(
        &mut self,
        event: RigEvent,
        sched: &mut EventScheduler<RigEvent>,
    ) -> Result<(), SchedulerError> {
        match event {
            RigEvent::Cia(e) => self.cia.handle_event(e, sched, &mut self.pins)?,
            RigEvent::Ack => {
                let icr = self.cia.read(ICR, sched, &mut self.pins)?;
                self.acks.push((sched.time(Phase::Phi2), icr));
            }
        }
        if self.auto_ack && self.pins.irq && !sched.is_pending(RigEvent::Ack) {
            sched.schedule(RigEvent::Ack, 0, Phase::Phi2)?;
        }
        Ok(())
    }
}

struct Rig {
    sched: EventScheduler<RigEvent>,
    board: Board,
}

impl Rig {
    fn new(model: CiaModel, skipping: bool) -> Self {
        let mut sched = EventScheduler::new();
        let mut cia = Cia::new(model, RigEvent::Cia);
        cia.set_cycle_skipping(skipping);
        cia.set_tod_rate(10.0);
        cia.reset(&mut sched).unwrap();
        let mut board = Board {
            cia,
            pins: Pins::default(),
            acks: Vec::new(),
            auto_ack: true,
        };
        // Park at PHI2 of cycle 0, where register accesses happen.
        sched.step_phase(&mut board).unwrap();
        Self { sched, board }
    }

    fn now(&self) -> u64 {
        self.sched.time(Phase::Phi2)
    }

    fn write(&mut self, reg: u8, value: u8) {
        self.board
            .cia
            .write(reg, value, &mut self.sched, &mut self.board.pins)
            .unwrap();
    }

    fn read(&mut self, reg: u8) -> u8 {
        self.board
            .cia
            .read(reg, &mut self.sched, &mut self.board.pins)
            .unwrap()
    }

    fn run(&mut self, cycles: u64) {
        self.sched.advance(cycles, &mut self.board).unwrap();
    }

    fn run_to(&mut self, cycle: u64) {
        let now = self.now();
        assert!(cycle >= now);
        self.run(cycle - now);
    }

    fn timer_a(&mut self) -> u16 {
        let lo = self.read(TAL);
        let hi = self.read(TAH);
        u16::from_le_bytes([lo, hi])
    }

    fn start_timer_a(&mut self, latch: u16, cra: u8) {
        self.write(TAL, latch as u8);
        self.write(TAH, (latch >> 8) as u8);
        self.write(ICR, 0x81);
        self.write(CRA, cra);
    }
}

const ALL_CONFIGS: [(CiaModel, bool); 4] = [
    (CiaModel::Mos6526A, true),
    (CiaModel::Mos6526A, false),
    (CiaModel::Mos6526, true),
    (CiaModel::Mos6526, false),
];

#[test]
fn continuous_timer_period_is_latch_plus_one() {
    for (model, skipping) in ALL_CONFIGS {
        let mut rig = Rig::new(model, skipping);
        rig.start_timer_a(10, 0x01);
        rig.run_to(60);

        // Counting starts two cycles after the start write.
        let delay = u64::from(model == CiaModel::Mos6526);
        let expected: Vec<(u64, u8)> = (0..5).map(|k| (12 + 11 * k + delay, 0x81)).collect();
        assert_eq!(rig.board.acks, expected, "{model:?} skipping={skipping}");
    }
}

#[test]
fn zero_latch_underflows_every_cycle() {
    for skipping in [true, false] {
        let mut rig = Rig::new(CiaModel::Mos6526A, skipping);
        rig.start_timer_a(0, 0x01);
        rig.run_to(10);
        let expected: Vec<(u64, u8)> = (2..10).map(|c| (c, 0x81)).collect();
        assert_eq!(rig.board.acks, expected);
    }
}

#[test]
fn one_shot_timer_stops_after_underflow() {
    for skipping in [true, false] {
        let mut rig = Rig::new(CiaModel::Mos6526A, skipping);
        rig.start_timer_a(5, 0x09);
        rig.run_to(100);
        assert_eq!(rig.board.acks, vec![(7, 0x81)]);
        assert_eq!(rig.read(CRA) & 0x01, 0);
        assert_eq!(rig.timer_a(), 5);
    }
}

#[test]
fn counter_reads_track_elapsed_cycles() {
    for skipping in [true, false] {
        let mut rig = Rig::new(CiaModel::Mos6526A, skipping);
        rig.start_timer_a(1000, 0x01);
        rig.run_to(2);
        assert_eq!(rig.timer_a(), 1000);
        rig.run_to(3);
        assert_eq!(rig.timer_a(), 999);
        rig.run_to(502);
        assert_eq!(rig.timer_a(), 500);
        rig.run_to(900);
        assert_eq!(rig.timer_a(), 102);
    }
}

#[test]
fn force_load_reloads_running_timer() {
    for skipping in [true, false] {
        let mut rig = Rig::new(CiaModel::Mos6526A, skipping);
        rig.start_timer_a(1000, 0x01);
        rig.run_to(402);
        assert_eq!(rig.timer_a(), 600);
        rig.write(CRA, 0x11);
        rig.run(2);
        assert_eq!(rig.timer_a(), 1000);
        rig.run(1);
        assert_eq!(rig.timer_a(), 1000);
        rig.run(1);
        assert_eq!(rig.timer_a(), 999);
    }
}

#[test]
fn timer_b_counts_timer_a_underflows() {
    for skipping in [true, false] {
        let mut rig = Rig::new(CiaModel::Mos6526A, skipping);
        rig.write(TAL, 4);
        rig.write(TAH, 0);
        rig.write(TBL, 2);
        rig.write(TBH, 0);
        rig.write(ICR, 0x83);
        rig.write(CRB, 0x41);
        rig.write(CRA, 0x01);
        rig.run_to(35);
        assert_eq!(
            rig.board.acks,
            vec![
                (6, 0x81),
                (11, 0x81),
                (16, 0x81),
                (17, 0x82),
                (21, 0x81),
                (26, 0x81),
                (31, 0x81),
                (32, 0x82),
            ]
        );
    }
}

#[test]
fn cascaded_timer_ignores_the_system_clock() {
    let mut rig = Rig::new(CiaModel::Mos6526A, true);
    rig.write(TBL, 0x10);
    rig.write(TBH, 0);
    rig.write(CRB, 0x41);
    rig.run(500);
    assert_eq!(rig.read(TBL), 0x10);
    assert_eq!(rig.read(CRB) & 0x01, 0x01);
}

/// Drive the chip through a pseudo-random mix of accesses and waits.
fn scripted_run(model: CiaModel, skipping: bool) -> (Vec<u8>, Vec<(u64, u8)>) {
    let mut rig = Rig::new(model, skipping);
    let mut seed = 0x1234_5678u32;
    let mut next = move || {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        (seed >> 16) as u16
    };

    let mut reads = Vec::new();
    rig.write(ICR, 0x83);
    for _ in 0..400 {
        match next() % 9 {
            0 => reads.push(rig.read(TAL)),
            1 => reads.push(rig.read(TAH)),
            2 => reads.push(rig.read(TBL)),
            3 => rig.write(TAL, (next() % 40) as u8),
            4 => rig.write(TBL, (next() % 20) as u8),
            5 => rig.write(TAH, 0),
            6 => rig.write(CRA, [0x01, 0x11, 0x09, 0x00, 0x19][usize::from(next() % 5)]),
            7 => rig.write(CRB, [0x01, 0x41, 0x11, 0x00, 0x49][usize::from(next() % 5)]),
            _ => reads.push(rig.read(CRA)),
        }
        rig.run(u64::from(next() % 90));
    }
    reads.push(rig.read(TAL));
    reads.push(rig.read(TBL));
    (reads, rig.board.acks)
}

#[test]
fn skipping_matches_per_cycle_ticking() {
    for model in [CiaModel::Mos6526A, CiaModel::Mos6526] {
        let lazy = scripted_run(model, true);
        let eager = scripted_run(model, false);
        assert!(!lazy.1.is_empty());
        assert_eq!(lazy, eager, "{model:?}");
    }
}

/// Like [`scripted_run`], but with full-width latches, arbitrary control
/// bits and waits long enough to span whole timer periods.
fn wide_run(model: CiaModel, skipping: bool, seed: u32) -> (Vec<u8>, Vec<(u64, u8)>) {
    let mut rig = Rig::new(model, skipping);
    let mut seed = seed;
    let mut next = move || {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        (seed >> 16) as u16
    };

    let mut reads = Vec::new();
    rig.write(ICR, 0x83);
    for _ in 0..300 {
        // Half the bytes stay small so underflows keep coming.
        let byte = if next() % 2 == 0 {
            (next() % 8) as u8
        } else {
            next() as u8
        };
        match next() % 12 {
            0 => reads.push(rig.read(TAL)),
            1 => reads.push(rig.read(TAH)),
            2 => reads.push(rig.read(TBL)),
            3 => reads.push(rig.read(TBH)),
            4 => rig.write(TAL, byte),
            5 => rig.write(TAH, byte),
            6 => rig.write(TBL, byte),
            7 => rig.write(TBH, byte),
            8 => rig.write(CRA, next() as u8 & 0x3F),
            9 => rig.write(CRB, next() as u8 & 0x7F),
            10 => reads.push(rig.read(0x01)),
            _ => {
                reads.push(rig.read(CRA));
                reads.push(rig.read(CRB));
            }
        }
        let wait = if next() % 8 == 0 {
            u64::from(next()) + u64::from(next() % 0x2000)
        } else {
            u64::from(next() % 300)
        };
        rig.run(wait);
    }
    for reg in [TAL, TAH, TBL, TBH, CRA, CRB, 0x01] {
        reads.push(rig.read(reg));
    }
    (reads, rig.board.acks)
}

#[test]
fn skipping_matches_ticking_over_long_periods() {
    for seed in 1..=12u32 {
        let seed = seed.wrapping_mul(0x9E37_79B9);
        for model in [CiaModel::Mos6526A, CiaModel::Mos6526] {
            let lazy = wide_run(model, true, seed);
            let eager = wide_run(model, false, seed);
            assert!(!lazy.1.is_empty(), "seed {seed:#x}");
            assert_eq!(lazy, eager, "{model:?} seed {seed:#x}");
        }
    }
}

#[test]
fn identical_scripts_are_deterministic() {
    assert_eq!(
        scripted_run(CiaModel::Mos6526, true),
        scripted_run(CiaModel::Mos6526, true)
    );
}

#[test]
fn reading_icr_clears_and_releases_the_line() {
    let mut rig = Rig::new(CiaModel::Mos6526A, true);
    rig.board.auto_ack = false;
    rig.start_timer_a(3, 0x09);
    rig.run(10);
    assert!(rig.board.pins.irq);
    assert_eq!(rig.read(ICR), 0x81);
    assert!(!rig.board.pins.irq);
    assert_eq!(rig.read(ICR), 0x00);
}

#[test]
fn masked_sources_latch_but_do_not_interrupt() {
    let mut rig = Rig::new(CiaModel::Mos6526A, true);
    rig.board.auto_ack = false;
    rig.write(TAL, 3);
    rig.write(TAH, 0);
    rig.write(CRA, 0x09);
    rig.run(10);
    assert!(!rig.board.pins.irq);
    assert_eq!(rig.read(ICR), 0x01);
}

#[test]
fn tod_alarm_raises_interrupt() {
    let mut rig = Rig::new(CiaModel::Mos6526A, true);
    rig.write(ICR, 0x84);
    rig.write(CRB, 0x80);
    rig.write(TOD_HR, 0x01);
    rig.write(TOD_TEN, 0x02);
    rig.write(CRB, 0x00);
    rig.write(TOD_HR, 0x01);
    rig.write(TOD_MIN, 0x00);
    rig.write(TOD_SEC, 0x00);
    rig.write(TOD_TEN, 0x00);

    // 60 Hz, ten cycles per mains period: a tenth every 60 cycles.
    rig.run_to(200);
    assert_eq!(rig.board.acks, vec![(120, 0x84)]);

    assert_eq!(rig.read(TOD_HR), 0x01);
    rig.run(60);
    assert_eq!(rig.read(TOD_SEC), 0x00);
    assert_eq!(rig.read(TOD_TEN), 0x03);
    assert_eq!(rig.read(TOD_TEN), 0x04);
}

#[test]
fn tod_runs_faster_at_fifty_hertz() {
    let mut rig = Rig::new(CiaModel::Mos6526A, true);
    rig.write(CRA, 0x80);
    rig.write(TOD_HR, 0x01);
    rig.write(TOD_TEN, 0x00);
    // The divisor switches at the next tenth (cycle 60), then every 50.
    rig.run_to(211);
    assert_eq!(rig.read(TOD_TEN), 0x04);
}

#[test]
fn serial_port_shifts_out_buffered_byte() {
    let mut rig = Rig::new(CiaModel::Mos6526A, true);
    rig.write(TAL, 1);
    rig.write(TAH, 0);
    rig.write(ICR, 0x88);
    rig.write(CRA, 0x41);
    rig.write(SDR, 0xA5);
    rig.run_to(60);
    assert_eq!(rig.board.cia.serial_out(), 0xA5);
    // Loaded on the underflow at cycle 3, then sixteen more underflows.
    // Timer A is latched too, though masked.
    assert_eq!(rig.board.acks, vec![(35, 0x89)]);
}

#[test]
fn timer_a_pulses_pb6() {
    let mut rig = Rig::new(CiaModel::Mos6526A, true);
    rig.start_timer_a(10, 0x03);
    rig.run_to(11);
    assert_eq!(rig.read(0x01), 0xBF);
    rig.run(1);
    assert_eq!(rig.read(0x01), 0xFF);
    rig.run(1);
    assert_eq!(rig.read(0x01), 0xBF);
}

#[test]
fn timer_a_toggles_pb6() {
    let mut rig = Rig::new(CiaModel::Mos6526A, true);
    rig.start_timer_a(10, 0x07);
    rig.run_to(11);
    assert_eq!(rig.read(0x01), 0xFF);
    rig.run(1);
    assert_eq!(rig.read(0x01), 0xBF);
    rig.run_to(23);
    assert_eq!(rig.read(0x01), 0xFF);
}

#[test]
fn port_a_combines_output_and_direction() {
    let mut rig = Rig::new(CiaModel::Mos6526A, true);
    rig.write(0x02, 0x0F);
    rig.write(0x00, 0x05);
    assert_eq!(rig.board.pins.port_a, Some(0xF5));
    assert_eq!(rig.read(0x00), 0xF5);
}

#[test]
fn state_queries_do_not_disturb_the_chip() {
    let mut rig = Rig::new(CiaModel::Mos6526A, true);
    rig.board.auto_ack = false;
    rig.start_timer_a(1000, 0x01);
    rig.run(10);

    let cia = &rig.board.cia;
    assert_eq!(cia.query("timer_a.mode"), Some(Value::String("skipping".into())));
    assert_eq!(cia.query("timer_a.latch"), Some(Value::U16(1000)));
    assert_eq!(cia.query("timer_b.running"), Some(Value::Bool(false)));
    assert_eq!(cia.query("icr.mask"), Some(Value::U8(0x01)));
    assert_eq!(cia.query("model"), Some(Value::String("Mos6526A".into())));
    assert_eq!(cia.query("bogus"), None);
    for path in cia.query_paths() {
        assert!(cia.query(path).is_some(), "{path}");
    }

    // Skipped cycles are only applied on access.
    assert_eq!(rig.timer_a(), 992);
}
