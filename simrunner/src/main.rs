use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use anyhow::{Context, Result, bail};
use clap::Parser;
use itertools::Itertools;
use log::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoEnumIterator, IntoStaticStr};

use ncr53_core::ncr::{
    AdapterConfig, AdapterSnapshot, CommandId, CommandResult, Completion, DataSegment,
    ScsiCommand,
};
use ncr53_core::scsi::*;
use ncr53_core::sim::SimHarness;
use ncr53_core::sim::chip::{Fault, SimChipStats};
use ncr53_core::sim::target::{SimBehavior, SimCaps, SimTarget, SimTargetStats, sense_data};
use ncr53_core::tickable::{TICKS_PER_SECOND, Ticks};

#[derive(Parser)]
#[command(about = "Drives the NCR 53C8XX engine against simulated SCSI targets")]
struct Args {
    /// Adapter configuration (JSON)
    #[arg(long)]
    config: Option<String>,

    /// Workload description (JSON)
    #[arg(long)]
    workload: Option<String>,

    /// Overrides the workload's command count
    #[arg(long)]
    commands: Option<usize>,

    /// Overrides the workload's random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Writes the JSON report here instead of stdout
    #[arg(long)]
    report: Option<String>,

    /// More logging, repeat for more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct TargetSetup {
    id: u8,
    sync: bool,
    wide: bool,
    tagged: bool,
    min_period: u8,
    max_offset: u8,
}

impl Default for TargetSetup {
    fn default() -> Self {
        let caps = SimCaps::default();
        Self {
            id: 0,
            sync: caps.sync,
            wide: caps.wide,
            tagged: caps.tagged,
            min_period: caps.min_period,
            max_offset: caps.max_offset,
        }
    }
}

impl TargetSetup {
    fn caps(&self) -> SimCaps {
        SimCaps {
            sync: self.sync,
            wide: self.wide,
            tagged: self.tagged,
            min_period: self.min_period,
            max_offset: self.max_offset,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Workload {
    seed: u64,
    targets: Vec<TargetSetup>,
    commands: usize,
    /// Commands submitted before the bus is left to settle
    batch: usize,
    max_blocks: u16,
    /// Share of commands run with a random misbehavior
    behavior_rate: f64,
    /// Faults injected before the given command number
    faults: Vec<(usize, Fault)>,
    /// Control commands issued once the targets are scanned
    user_commands: Vec<String>,
    settle_limit: Ticks,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            seed: 0,
            targets: vec![
                TargetSetup {
                    id: 0,
                    ..Default::default()
                },
                TargetSetup {
                    id: 3,
                    wide: false,
                    tagged: false,
                    ..Default::default()
                },
            ],
            commands: 200,
            batch: 4,
            max_blocks: 16,
            behavior_rate: 0.2,
            faults: vec![],
            user_commands: vec![],
            settle_limit: 60 * TICKS_PER_SECOND,
        }
    }
}

/// Misbehaviors picked at random for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, IntoStaticStr)]
enum Mix {
    Disconnect,
    PhaseMismatch,
    CheckCondition,
    Busy,
    QueueFull,
    Underrun,
    IgnoreWideResidue,
    InitiateSync,
    RejectNegotiation,
}

impl Mix {
    fn behavior(self, rng: &mut StdRng, len: usize) -> SimBehavior {
        let hold = rng.random_range(1..=5) * 100;
        match self {
            Self::Disconnect => SimBehavior::Disconnect { hold },
            Self::PhaseMismatch => SimBehavior::PhaseMismatch {
                at: rng.random_range(1..len.max(2)),
                hold,
            },
            Self::CheckCondition => SimBehavior::CheckCondition {
                // UNIT ATTENTION, power on or reset occurred
                sense: sense_data(0x06, 0x29, 0),
            },
            Self::Busy => SimBehavior::Status(STATUS_BUSY),
            Self::QueueFull => SimBehavior::Status(STATUS_QUEUE_FULL),
            Self::Underrun => SimBehavior::Underrun {
                short: rng.random_range(1..len.max(2)),
            },
            Self::IgnoreWideResidue => SimBehavior::IgnoreWideResidue,
            Self::InitiateSync => SimBehavior::InitiateSync {
                period: rng.random_range(10..=50),
                offset: rng.random_range(0..=31),
            },
            Self::RejectNegotiation => SimBehavior::RejectNegotiation,
        }
    }
}

struct Pending {
    target: u8,
    lba: u32,
    buf: DataSegment,
    read: bool,
    /// Data is checked only for commands run without misbehavior
    verify: bool,
}

#[derive(Serialize)]
struct TargetReport {
    id: u8,
    stats: SimTargetStats,
}

#[derive(Serialize)]
struct Report {
    seed: u64,
    commands: usize,
    results: BTreeMap<&'static str, usize>,
    behaviors: BTreeMap<&'static str, usize>,
    mismatches: usize,
    bytes: u64,
    adapter: AdapterSnapshot,
    chip: SimChipStats,
    targets: Vec<TargetReport>,
}

fn load_json<T: for<'de> Deserialize<'de> + Default>(path: Option<&str>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let json = fs::read_to_string(path).with_context(|| format!("Reading '{}'", path))?;
    serde_json::from_str(&json).with_context(|| format!("Parsing '{}'", path))
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .init();

    let config = match args.config.as_deref() {
        Some(path) => AdapterConfig::from_json(
            &fs::read_to_string(path).with_context(|| format!("Reading '{}'", path))?,
        )?,
        None => AdapterConfig::default(),
    };
    let mut workload: Workload = load_json(args.workload.as_deref())?;
    if let Some(n) = args.commands {
        workload.commands = n;
    }
    if let Some(seed) = args.seed {
        workload.seed = seed;
    }
    if workload.targets.is_empty() {
        bail!("Workload has no targets");
    }
    if workload.max_blocks == 0 || workload.batch == 0 {
        bail!("Workload needs a non-zero batch and block count");
    }

    let report = run(config, &workload)?;
    let json = serde_json::to_string_pretty(&report)?;
    match args.report.as_deref() {
        Some(path) => fs::write(path, json).with_context(|| format!("Writing '{}'", path))?,
        None => println!("{}", json),
    }
    if report.mismatches > 0 {
        warn!("{} commands moved wrong data", report.mismatches);
    }
    Ok(())
}

fn run(config: AdapterConfig, workload: &Workload) -> Result<Report> {
    let mut rng = StdRng::seed_from_u64(workload.seed);
    let mut harness = SimHarness::new(config)?;
    for setup in &workload.targets {
        harness.attach_target(SimTarget::with_caps(setup.id, setup.caps()))?;
    }

    // INQUIRY opens negotiation and queueing for every target
    let inq = harness.alloc_buffer(36)?;
    for setup in &workload.targets {
        let id = harness.next_id();
        let cmd = ScsiCommand::new(id, setup.id, 0, Cdb::inquiry(36)).with_segments(vec![inq]);
        harness.submit(cmd)?;
        for c in harness.settle(workload.settle_limit)? {
            info!("Target {} INQUIRY: {:?}", setup.id, c.result);
        }
    }
    for cmd in &workload.user_commands {
        harness.user_command(cmd)?;
    }

    let buf_len = usize::from(workload.max_blocks) * 512;
    let mut pool = Vec::with_capacity(workload.batch);
    for _ in 0..workload.batch {
        pool.push(harness.alloc_buffer(buf_len)?);
    }

    let mut results = BTreeMap::<&'static str, usize>::new();
    let mut behaviors = BTreeMap::<&'static str, usize>::new();
    let mut mismatches = 0;
    let mixes = Mix::iter().collect_vec();

    let mut issued = 0;
    while issued < workload.commands {
        let mut pending = BTreeMap::<CommandId, Pending>::new();
        let mut misbehaving = BTreeSet::new();
        for &buf in &pool {
            if issued == workload.commands {
                break;
            }
            for &(_, fault) in workload.faults.iter().filter(|(at, _)| *at == issued) {
                info!("Injecting {:?} before command {}", fault, issued);
                harness.chip_mut().inject(fault);
            }
            issued += 1;

            let setup = &workload.targets[rng.random_range(0..workload.targets.len())];
            let blocks = rng.random_range(1..=workload.max_blocks);
            let len = usize::from(blocks) * 512;
            let lba = rng.random_range(0..1_000_000);
            let read = rng.random_bool(0.5);
            let buf = DataSegment {
                addr: buf.addr,
                len: len as u32,
            };

            if rng.random_bool(workload.behavior_rate) {
                let mix = mixes[rng.random_range(0..mixes.len())];
                *behaviors.entry(mix.into()).or_default() += 1;
                let behavior = mix.behavior(&mut rng, len);
                if let Some(t) = harness.target_mut(setup.id) {
                    t.push_behavior(behavior);
                }
                misbehaving.insert(setup.id);
            }

            let cdb = if read {
                Cdb::read_10(lba, blocks)
            } else {
                let data = harness
                    .target(setup.id)
                    .map(|t| t.pattern(lba, len))
                    .unwrap_or_default();
                harness.fill_buffer(buf, &data)?;
                Cdb::write_10(lba, blocks)
            };
            let id = harness.next_id();
            let cmd = ScsiCommand::new(id, setup.id, 0, cdb).with_segments(vec![buf]);
            let submitted = harness.submit(cmd)?;
            debug!("{} to target {}: {:?}", id, setup.id, submitted);
            pending.insert(
                id,
                Pending {
                    target: setup.id,
                    lba,
                    buf,
                    read,
                    verify: true,
                },
            );
        }
        // A behavior goes to whichever command the target sees next
        for p in pending.values_mut() {
            p.verify = !misbehaving.contains(&p.target);
        }

        let done = harness.settle(workload.settle_limit)?;
        for c in &done {
            *results.entry(c.result.into()).or_default() += 1;
            if let Some(p) = pending.remove(&c.id) {
                if !check(&harness, &p, c)? {
                    warn!("{}: data mismatch on target {} LBA {}", c.id, p.target, p.lba);
                    mismatches += 1;
                }
            }
        }
        for id in pending.keys() {
            warn!("{} never completed", id);
        }
        if !pending.is_empty() {
            bail!("{} commands lost", pending.len());
        }
        harness.adapter().verify_invariants()?;
    }

    let adapter = harness.adapter().snapshot();
    info!(
        "{} commands, {} interrupts, {} bytes",
        adapter.profile.num_trans, adapter.profile.num_int, adapter.profile.num_bytes
    );
    Ok(Report {
        seed: workload.seed,
        commands: workload.commands,
        results,
        behaviors,
        mismatches,
        bytes: adapter.profile.num_bytes,
        chip: *harness.chip().stats(),
        targets: workload
            .targets
            .iter()
            .filter_map(|s| harness.target(s.id))
            .map(|t| TargetReport {
                id: t.id(),
                stats: t.stats().clone(),
            })
            .collect(),
        adapter,
    })
}

/// Whether a completed command moved the data the target holds
fn check(harness: &SimHarness, p: &Pending, c: &Completion) -> Result<bool> {
    if !p.verify || c.result != CommandResult::Ok {
        return Ok(true);
    }
    let Some(t) = harness.target(p.target) else {
        return Ok(true);
    };
    let expected = t.pattern(p.lba, p.buf.len as usize);
    if p.read {
        return Ok(harness.read_buffer(p.buf)? == expected);
    }
    Ok(t
        .writes()
        .iter()
        .rev()
        .find(|(lba, _)| *lba == p.lba)
        .is_some_and(|(_, data)| *data == expected))
}
