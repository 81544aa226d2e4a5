//! Acquisition engine behaviour against a scripted test instrument.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use daq_core::{AcquisitionEngine, DaqError, EngineContext, EngineState, Field, Instrument};
use parking_lot::Mutex;

#[derive(Default)]
struct Probe {
    trace: Mutex<Vec<String>>,
    in_command: AtomicBool,
    overlaps: AtomicUsize,
    cleanups: AtomicUsize,
    cycles: AtomicUsize,
    entered: Mutex<Vec<f64>>,
}

#[derive(Clone, Copy)]
enum Behaviour {
    Normal,
    FailSetup,
    BlockInSample,
    FatalAfter(usize),
    TransientEvery(usize),
    SlowSample(u64),
}

struct Scripted {
    probe: Arc<Probe>,
    behaviour: Behaviour,
}

#[async_trait]
impl Instrument for Scripted {
    type Command = u32;
    type Sample = usize;

    fn kind(&self) -> &'static str {
        "scripted"
    }

    fn headers(&self) -> Vec<String> {
        vec!["Cycle".to_string()]
    }

    fn format_sample(sample: &usize) -> Vec<Field> {
        vec![Field::Int(*sample as i64)]
    }

    async fn setup(&mut self, _ctx: &mut EngineContext<Self>) -> Result<(), DaqError> {
        match self.behaviour {
            Behaviour::FailSetup => Err(DaqError::setup("scripted", "no such device")),
            _ => Ok(()),
        }
    }

    async fn sample(&mut self, ctx: &mut EngineContext<Self>) -> Result<Option<usize>, DaqError> {
        if self.probe.in_command.load(Ordering::SeqCst) {
            self.probe.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let cycle = self.probe.cycles.fetch_add(1, Ordering::SeqCst);
        self.probe.entered.lock().push(ctx.elapsed());
        match self.behaviour {
            Behaviour::BlockInSample => {
                ctx.wait_with_cancel(Duration::from_secs(60)).await?;
            }
            Behaviour::FatalAfter(n) if cycle >= n => {
                return Err(DaqError::TransportClosed("link down".into()));
            }
            Behaviour::TransientEvery(n) if cycle % n == 0 => {
                ctx.wait_with_cancel(Duration::from_millis(1)).await?;
                return Err(DaqError::TransientRead("timeout".into()));
            }
            Behaviour::SlowSample(ms) => {
                ctx.wait_with_cancel(Duration::from_millis(ms)).await?;
                return Ok(Some(cycle));
            }
            _ => {}
        }
        ctx.wait_with_cancel(Duration::from_millis(1)).await?;
        // Odd cycles have nothing to report.
        Ok((cycle % 2 == 0).then_some(cycle))
    }

    async fn apply(&mut self, command: u32, ctx: &mut EngineContext<Self>) -> Result<(), DaqError> {
        self.probe.in_command.store(true, Ordering::SeqCst);
        ctx.wait_with_cancel(Duration::from_millis(2)).await?;
        self.probe.trace.lock().push(format!("cmd {command}"));
        self.probe.in_command.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn on_record_start(&mut self) -> Result<(), DaqError> {
        self.probe.trace.lock().push("record start".into());
        Ok(())
    }

    async fn on_record_stop(&mut self) -> Result<(), DaqError> {
        self.probe.trace.lock().push("record stop".into());
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.probe.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

fn start(behaviour: Behaviour) -> (AcquisitionEngine<Scripted>, Arc<Probe>) {
    let probe = Arc::new(Probe::default());
    let instrument = Scripted {
        probe: probe.clone(),
        behaviour,
    };
    let engine = AcquisitionEngine::start("scripted", instrument, Instant::now()).unwrap();
    (engine, probe)
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn commands_run_in_fifo_order_without_overlapping_samples() {
    let (mut engine, probe) = start(Behaviour::Normal);
    engine.wait_for_setup().unwrap();
    assert_eq!(engine.state(), EngineState::Running);

    for i in 0..25 {
        engine.enqueue(i).unwrap();
    }
    wait_for(|| probe.trace.lock().len() == 25);

    let expected: Vec<String> = (0..25).map(|i| format!("cmd {i}")).collect();
    assert_eq!(*probe.trace.lock(), expected);
    assert_eq!(probe.overlaps.load(Ordering::SeqCst), 0);

    engine.stop();
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(probe.cleanups.load(Ordering::SeqCst), 1);
}

#[test]
fn absent_samples_are_not_queued() {
    let (mut engine, probe) = start(Behaviour::Normal);
    engine.wait_for_setup().unwrap();
    wait_for(|| probe.cycles.load(Ordering::SeqCst) >= 10);
    engine.stop();

    let drained = engine.drain_samples();
    assert!(!drained.is_empty());
    assert!(drained.iter().all(|a| a.sample % 2 == 0));
    let cycles: Vec<usize> = drained.iter().map(|a| a.sample).collect();
    let mut sorted = cycles.clone();
    sorted.sort_unstable();
    assert_eq!(cycles, sorted);
    assert!(drained.windows(2).all(|w| w[0].elapsed <= w[1].elapsed));
    assert!(engine.drain_samples().is_empty());
}

#[test]
fn setup_failure_is_surfaced_and_stop_is_safe() {
    let (mut engine, probe) = start(Behaviour::FailSetup);
    let err = engine.wait_for_setup().unwrap_err();
    assert!(matches!(err, DaqError::Setup { .. }));
    wait_for(|| engine.state().is_terminal());
    assert!(matches!(engine.state(), EngineState::Failed(_)));
    assert_eq!(probe.cycles.load(Ordering::SeqCst), 0);

    engine.stop();
    engine.stop();
    assert_eq!(probe.cleanups.load(Ordering::SeqCst), 1);
    // A second wait reports the recorded failure.
    assert!(engine.wait_for_setup().is_err());
}

#[test]
fn stop_interrupts_a_long_wait() {
    let (mut engine, probe) = start(Behaviour::BlockInSample);
    engine.wait_for_setup().unwrap();
    wait_for(|| probe.cycles.load(Ordering::SeqCst) >= 1);

    let begin = Instant::now();
    engine.stop();
    assert!(begin.elapsed() < Duration::from_secs(2));
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[test]
fn transport_loss_fails_only_that_engine() {
    let (mut failing, _) = start(Behaviour::FatalAfter(3));
    let (mut healthy, healthy_probe) = start(Behaviour::Normal);
    failing.wait_for_setup().unwrap();
    healthy.wait_for_setup().unwrap();

    wait_for(|| failing.state().is_terminal());
    assert!(matches!(failing.state(), EngineState::Failed(reason) if reason.contains("link down")));
    wait_for(|| failing.enqueue(1).is_err());

    let before = healthy_probe.cycles.load(Ordering::SeqCst);
    wait_for(|| healthy_probe.cycles.load(Ordering::SeqCst) > before + 3);
    assert!(healthy.is_running());
}

#[test]
fn transient_errors_drop_the_cycle_only() {
    let (mut engine, probe) = start(Behaviour::TransientEvery(4));
    engine.wait_for_setup().unwrap();
    wait_for(|| probe.cycles.load(Ordering::SeqCst) >= 12);
    assert!(engine.is_running());
    engine.stop();

    let samples: Vec<usize> = engine.drain_samples().into_iter().map(|a| a.sample).collect();
    assert!(samples.iter().all(|cycle| cycle % 4 != 0));
    assert!(!samples.is_empty());
}

#[test]
fn record_notifications_reach_the_driver_in_order() {
    let (mut engine, probe) = start(Behaviour::Normal);
    engine.wait_for_setup().unwrap();

    engine.send(daq_core::EngineCommand::RecordStart).unwrap();
    engine.enqueue(7).unwrap();
    engine.send(daq_core::EngineCommand::RecordStop).unwrap();
    wait_for(|| probe.trace.lock().len() == 3);

    assert_eq!(
        *probe.trace.lock(),
        vec!["record start".to_string(), "cmd 7".into(), "record stop".into()]
    );
    engine.stop();
}

#[test]
fn samples_are_stamped_when_their_cycle_begins() {
    let (mut engine, probe) = start(Behaviour::SlowSample(100));
    engine.wait_for_setup().unwrap();
    wait_for(|| probe.cycles.load(Ordering::SeqCst) >= 3);
    engine.stop();

    let entered = probe.entered.lock().clone();
    let drained = engine.drain_samples();
    assert!(drained.len() >= 2);
    for acquired in &drained {
        let began = entered[acquired.sample];
        assert!(acquired.elapsed <= began + 0.05, "{} stamped at {}", began, acquired.elapsed);
        assert!(acquired.elapsed >= began - 0.05);
    }
}
