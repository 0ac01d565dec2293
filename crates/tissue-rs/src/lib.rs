//! # Tissue-RS
//!
//! Embeds intracellular IFN / virus networks into an agent-based tissue.
//!
//! The spatial side (lattice, diffusion, cell mechanics) belongs to a host
//! framework, reached through the [`CellPopulation`] and [`FieldSecretor`]
//! traits. This crate owns everything that happens between the host's step
//! callbacks:
//!
//! - one [`ModelInstance`] per (infected cell, network), held by the
//!   [`InstanceManager`]
//! - the extracellular IFN ledger ([`ExtracellularField`])
//! - the stochastic infected → dead transition ([`DeathPolicy`])
//!
//! ## Step Order (coupled scenario)
//!
//! ```text
//! reconcile population -> integrate all instances -> sample deaths
//!   -> couple inputs (field snapshot from start of step)
//!   -> secrete into field -> apply decay -> measure field
//! ```
//!
//! A [`Tissue`] host with a well-mixed scalar field is provided for
//! standalone runs and tests.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use virosig_core::{CellId, Result, StepClock, Time, TimeSeries, VirosigError};
use virosig_network::{models, FixedStepIntegrator, IntegratorConfig, ModelInstance, ReactionNetwork};

// ============================================================================
// HOST COLLABORATORS
// ============================================================================

/// Discrete cell state as tracked by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CellKind {
    Uninfected,
    Eclipse,
    Infected,
    Dead,
}

impl CellKind {
    /// Short label used in reports (U, I1, I2, D)
    pub fn label(self) -> &'static str {
        match self {
            Self::Uninfected => "U",
            Self::Eclipse => "I1",
            Self::Infected => "I2",
            Self::Dead => "D",
        }
    }
}

/// Population queries and type changes
pub trait CellPopulation {
    /// Cells currently of `kind`, in a stable order
    fn cells_of_kind(&self, kind: CellKind) -> Vec<CellId>;

    /// Cell volume in host units (lattice sites)
    fn volume(&self, cell: CellId) -> f64;

    fn set_kind(&mut self, cell: CellId, kind: CellKind);
}

/// Extracellular field access
pub trait FieldSecretor {
    /// Secrete `amount_per_volume` uniformly over the cell; returns the total released
    fn secrete_inside_cell_total_count(&mut self, cell: CellId, amount_per_volume: f64) -> f64;

    /// Field amount summed over the cell's footprint
    fn amount_seen_by_cell(&self, cell: CellId) -> f64;

    /// Per-step decay applied by the host's own field update
    fn set_decay_rate(&mut self, per_step: f64);

    /// Host field update (diffusion, decay) run once per step before the models
    fn relax(&mut self) {}
}

/// Everything a cellular model needs from the host
pub trait Host: CellPopulation + FieldSecretor {}

impl<T: CellPopulation + FieldSecretor> Host for T {}

// ============================================================================
// INSTANCE MANAGER
// ============================================================================

/// Owns every per-cell model instance
///
/// Instances are keyed cell id → network name. A tracked cell has exactly one
/// instance per network it was attached to; a detached cell has none.
#[derive(Debug, Clone, Default)]
pub struct InstanceManager {
    networks: BTreeMap<String, Arc<ReactionNetwork>>,
    instances: BTreeMap<CellId, BTreeMap<String, ModelInstance>>,
    overrides: BTreeMap<String, f64>,
    multipliers: BTreeMap<String, f64>,
}

impl InstanceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameter values applied to every new instance that defines them
    pub fn with_parameters(
        mut self,
        overrides: BTreeMap<String, f64>,
        multipliers: BTreeMap<String, f64>,
    ) -> Self {
        self.overrides = overrides;
        self.multipliers = multipliers;
        self
    }

    /// Register a network template; replaces any template of the same name
    pub fn register(&mut self, network: ReactionNetwork) -> Arc<ReactionNetwork> {
        let network = Arc::new(network);
        self.networks
            .insert(network.name().to_string(), Arc::clone(&network));
        network
    }

    pub fn network(&self, name: &str) -> Result<Arc<ReactionNetwork>> {
        self.networks
            .get(name)
            .cloned()
            .ok_or_else(|| VirosigError::NetworkNotFound(name.to_string()))
    }

    /// Fresh instance of a registered network with overrides applied
    pub fn instantiate(&self, name: &str) -> Result<ModelInstance> {
        let mut instance = ModelInstance::new(self.network(name)?);
        for (param, value) in &self.overrides {
            if instance.network().parameter_index(param).is_some() {
                instance.set(param, *value)?;
            }
        }
        for (param, factor) in &self.multipliers {
            if instance.network().parameter_index(param).is_some() {
                instance.scale(param, *factor)?;
            }
        }
        Ok(instance)
    }

    /// Create the instance of `network` for `cell`
    pub fn attach(&mut self, cell: CellId, network: &str) -> Result<&mut ModelInstance> {
        let instance = self.instantiate(network)?;
        let slots = self.instances.entry(cell).or_default();
        if slots.contains_key(network) {
            return Err(VirosigError::AlreadyAttached {
                cell,
                network: network.to_string(),
            });
        }
        log::debug!("attached {} to cell {}", network, cell);
        Ok(slots.entry(network.to_string()).or_insert(instance))
    }

    /// Drop every instance of `cell`; returns how many were removed
    pub fn detach(&mut self, cell: CellId) -> usize {
        match self.instances.remove(&cell) {
            Some(slots) => {
                log::debug!("detached cell {} ({} instances)", cell, slots.len());
                slots.len()
            }
            None => 0,
        }
    }

    pub fn get(&self, cell: CellId, network: &str) -> Result<&ModelInstance> {
        self.instances
            .get(&cell)
            .and_then(|slots| slots.get(network))
            .ok_or_else(|| VirosigError::InstanceNotFound {
                cell,
                network: network.to_string(),
            })
    }

    pub fn get_mut(&mut self, cell: CellId, network: &str) -> Result<&mut ModelInstance> {
        self.instances
            .get_mut(&cell)
            .and_then(|slots| slots.get_mut(network))
            .ok_or_else(|| VirosigError::InstanceNotFound {
                cell,
                network: network.to_string(),
            })
    }

    pub fn is_tracked(&self, cell: CellId) -> bool {
        self.instances.contains_key(&cell)
    }

    pub fn tracked_cells(&self) -> Vec<CellId> {
        self.instances.keys().copied().collect()
    }

    pub fn cell_count(&self) -> usize {
        self.instances.len()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.values().map(BTreeMap::len).sum()
    }

    /// Integrate every instance by `dt`; instances are independent
    pub fn advance_all(&mut self, integrator: &FixedStepIntegrator, dt: Time) -> Result<()> {
        self.instances.par_iter_mut().try_for_each(|(&cell, slots)| {
            slots
                .values_mut()
                .try_for_each(|instance| instance.advance(integrator, dt))
                .map_err(|e| e.for_cell(cell))
        })
    }

    /// Mean of `variable` in `network` over tracked cells; 0.0 when empty
    pub fn mean(&self, network: &str, variable: &str) -> Result<f64> {
        if self.instances.is_empty() {
            return Ok(0.0);
        }
        let mut sum = 0.0;
        for &cell in self.instances.keys() {
            sum += self.get(cell, network)?.get(variable)?;
        }
        Ok(sum / self.instances.len() as f64)
    }
}

// ============================================================================
// EXTRACELLULAR FIELD
// ============================================================================

/// Ledger for the secreted extracellular IFN total
///
/// Only [`secrete`](Self::secrete) and [`apply_decay`](Self::apply_decay)
/// change the total, so `total == initial + secreted - decayed` always holds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtracellularField {
    initial: f64,
    total: f64,
    secreted: f64,
    decayed: f64,
    step_start: f64,
}

impl ExtracellularField {
    pub fn new(initial: f64) -> Self {
        Self {
            initial,
            total: initial,
            secreted: 0.0,
            decayed: 0.0,
            step_start: initial,
        }
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    /// Cumulative secretion
    pub fn secreted(&self) -> f64 {
        self.secreted
    }

    /// Cumulative decay
    pub fn decayed(&self) -> f64 {
        self.decayed
    }

    /// Total as of the last [`begin_step`](Self::begin_step)
    pub fn step_start(&self) -> f64 {
        self.step_start
    }

    /// Snapshot the total; decay this step is computed on the snapshot
    pub fn begin_step(&mut self) {
        self.step_start = self.total;
    }

    pub fn secrete(&mut self, amount: f64) {
        self.total += amount;
        self.secreted += amount;
    }

    /// Remove `rate_per_step × step_start`; returns the amount removed
    pub fn apply_decay(&mut self, rate_per_step: f64) -> f64 {
        let amount = rate_per_step * self.step_start;
        self.total -= amount;
        self.decayed += amount;
        amount
    }

    /// Conservation residual, zero up to rounding
    pub fn balance(&self) -> f64 {
        self.initial + self.secreted - self.decayed - self.total
    }

    pub fn ensure_finite(&self) -> Result<()> {
        if self.total.is_finite() {
            Ok(())
        } else {
            Err(VirosigError::NumericalError(format!(
                "extracellular IFN total became {}",
                self.total
            )))
        }
    }
}

// ============================================================================
// DEATH POLICY
// ============================================================================

/// Per-step death probability formula
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeathRule {
    /// `k61·Δt·V·(1−P)` on the cell's own viral model
    InfectedFraction,
    /// `k61·Δt·V` on a shared reference model
    ViralLoad,
}

/// Stochastic infected → dead transition with a single seeded stream
#[derive(Debug, Clone)]
pub struct DeathPolicy {
    rule: DeathRule,
    dt: Time,
    rng: ChaCha8Rng,
    draws: u64,
}

impl DeathPolicy {
    pub fn new(rule: DeathRule, dt: Time, seed: u64) -> Self {
        Self {
            rule,
            dt,
            rng: ChaCha8Rng::seed_from_u64(seed),
            draws: 0,
        }
    }

    pub fn rule(&self) -> DeathRule {
        self.rule
    }

    /// Samples drawn so far
    pub fn draws(&self) -> u64 {
        self.draws
    }

    /// Unclamped death probability for one step
    pub fn probability(&self, instance: &ModelInstance) -> Result<f64> {
        let k61 = instance.get("k61")? * self.dt;
        let v = instance.get("V")?;
        Ok(match self.rule {
            DeathRule::InfectedFraction => k61 * v * (1.0 - instance.get("P")?),
            DeathRule::ViralLoad => k61 * v,
        })
    }

    /// Draw one uniform sample; true iff it falls below the probability
    pub fn maybe_kill(&mut self, cell: CellId, instance: &ModelInstance) -> Result<bool> {
        let p = self.probability(instance)?;
        let sample: f64 = self.rng.gen();
        self.draws += 1;
        if p > 1.0 {
            log::debug!("death probability {:.3} > 1 for cell {}", p, cell);
        }
        Ok(sample < p)
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Which pair of reference / per-cell models drives the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    /// Per-cell `VModel` + `IModel` coupled through the field
    Coupled,
    /// Reference `ODEModel` drives every cell; per-cell IRF7 `submodel`
    Lumped,
}

/// Run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub scenario: Scenario,
    /// Minutes of model time per host step
    pub minutes_per_step: f64,
    pub duration_hours: f64,
    pub seed: u64,
    /// Coupled scenario: couple cells to each other and the field instead of the reference model
    pub feedback_enabled: bool,
    pub plot_ode_traces: bool,
    pub plot_cell_averages: bool,
    pub integrator: IntegratorConfig,
    /// Parameter name → value, applied to every network defining it
    pub parameter_overrides: BTreeMap<String, f64>,
    /// Parameter name → factor, applied after overrides
    pub parameter_multipliers: BTreeMap<String, f64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self::coupled()
    }
}

impl SimulationConfig {
    /// 10 min per step for 10 days
    pub fn coupled() -> Self {
        Self {
            scenario: Scenario::Coupled,
            minutes_per_step: 10.0,
            duration_hours: 240.0,
            seed: 12345,
            feedback_enabled: true,
            plot_ode_traces: true,
            plot_cell_averages: true,
            integrator: IntegratorConfig::default(),
            parameter_overrides: BTreeMap::new(),
            parameter_multipliers: BTreeMap::new(),
        }
    }

    /// 20 min per step for 36 hours
    pub fn lumped() -> Self {
        Self {
            scenario: Scenario::Lumped,
            minutes_per_step: 20.0,
            duration_hours: 36.0,
            ..Self::coupled()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| VirosigError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| VirosigError::ConfigError(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.minutes_per_step.is_finite() && self.minutes_per_step > 0.0) {
            return Err(VirosigError::ConfigError(format!(
                "minutes_per_step must be positive, got {}",
                self.minutes_per_step
            )));
        }
        if !self.duration_hours.is_finite() || self.duration_hours < 0.0 {
            return Err(VirosigError::ConfigError(format!(
                "duration_hours must be non-negative, got {}",
                self.duration_hours
            )));
        }
        if self.integrator.substeps == 0 {
            return Err(VirosigError::ConfigError("integrator.substeps must be at least 1".into()));
        }
        for (name, value) in self.parameter_overrides.iter().chain(&self.parameter_multipliers) {
            if !value.is_finite() {
                return Err(VirosigError::ConfigError(format!(
                    "parameter {} has non-finite value {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    pub fn clock(&self) -> StepClock {
        StepClock::new(self.minutes_per_step)
    }

    pub fn total_steps(&self) -> u64 {
        self.clock().steps_for_hours(self.duration_hours)
    }
}

// ============================================================================
// CELLULAR MODEL
// ============================================================================

/// What happened during one host step
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepReport {
    pub mcs: u64,
    pub hours: f64,
    pub uninfected: usize,
    pub eclipse: usize,
    pub infected: usize,
    pub dead: usize,
    pub deaths: usize,
    pub attached: usize,
    pub detached: usize,
    pub skipped: usize,
    pub secreted: f64,
    pub decayed: f64,
    pub field_total: f64,
    pub field_seen: f64,
    pub mean_v: f64,
    /// Cells killed this step, in evaluation order
    #[serde(skip)]
    pub killed: Vec<CellId>,
    /// Cells skipped because an instance was missing
    #[serde(skip)]
    pub skipped_cells: Vec<CellId>,
}

impl StepReport {
    fn skip(&mut self, err: VirosigError, cell: CellId) -> Result<()> {
        if !err.is_not_found() {
            return Err(err);
        }
        log::warn!("step {}: skipping cell {}: {}", self.mcs, cell, err);
        self.skipped += 1;
        self.skipped_cells.push(cell);
        Ok(())
    }

    fn count_population<P: CellPopulation + ?Sized>(&mut self, host: &P) {
        self.uninfected = host.cells_of_kind(CellKind::Uninfected).len();
        self.eclipse = host.cells_of_kind(CellKind::Eclipse).len();
        self.infected = host.cells_of_kind(CellKind::Infected).len();
        self.dead = host.cells_of_kind(CellKind::Dead).len();
    }
}

/// Recorded time series keyed by name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Traces {
    series: BTreeMap<String, TimeSeries>,
}

impl Traces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str, t: Time, value: f64) {
        self.series
            .entry(name.to_string())
            .or_insert_with(|| TimeSeries::new(name))
            .push(t, value);
    }

    pub fn get(&self, name: &str) -> Option<&TimeSeries> {
        self.series.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.series.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TimeSeries)> {
        self.series.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// Callbacks invoked by the host framework
pub trait CellularModel {
    fn on_simulation_start<H: Host>(&mut self, host: &mut H) -> Result<()>;

    fn on_step<H: Host>(&mut self, mcs: u64, host: &mut H) -> Result<StepReport>;
}

/// State shared by both scenarios
#[derive(Debug, Clone)]
pub struct ModelCore {
    pub config: SimulationConfig,
    pub clock: StepClock,
    pub integrator: FixedStepIntegrator,
    pub manager: InstanceManager,
    /// Free-floating reference model
    pub reference: ModelInstance,
    pub field: ExtracellularField,
    pub policy: DeathPolicy,
    pub traces: Traces,
    pub initial_infected: usize,
    cell_networks: Vec<String>,
}

impl ModelCore {
    fn new(
        config: SimulationConfig,
        reference: ReactionNetwork,
        cell_networks: Vec<ReactionNetwork>,
        rule: DeathRule,
    ) -> Result<Self> {
        config.validate()?;
        let clock = config.clock();
        let mut manager = InstanceManager::new().with_parameters(
            config.parameter_overrides.clone(),
            config.parameter_multipliers.clone(),
        );
        let reference_name = reference.name().to_string();
        manager.register(reference);
        let names = cell_networks
            .into_iter()
            .map(|network| manager.register(network).name().to_string())
            .collect();
        let reference = manager.instantiate(&reference_name)?;
        let field = ExtracellularField::new(reference.get("IFNe")?);

        Ok(Self {
            integrator: FixedStepIntegrator::new(config.integrator),
            policy: DeathPolicy::new(rule, clock.hours_per_step(), config.seed),
            clock,
            manager,
            reference,
            field,
            traces: Traces::new(),
            initial_infected: 0,
            cell_networks: names,
            config,
        })
    }

    fn dt(&self) -> Time {
        self.clock.hours_per_step()
    }

    /// Reference parameter scaled to one step
    fn per_step(&self, name: &str) -> Result<f64> {
        Ok(self.clock.per_step(self.reference.get(name)?))
    }

    /// Per-step decay fraction from rate `name`; above 1 the field overshoots below zero
    fn decay_per_step(&self, name: &str) -> Result<f64> {
        let fraction = self.per_step(name)?;
        if fraction > 1.0 {
            log::warn!(
                "{} decays {:.3} of the field per step; totals will change sign",
                name,
                fraction
            );
        }
        Ok(fraction)
    }

    /// Attach newly infected cells, detach cells no longer infected
    fn reconcile<P: CellPopulation + ?Sized>(&mut self, host: &P, report: &mut StepReport) -> Result<()> {
        let infected: BTreeSet<CellId> = host.cells_of_kind(CellKind::Infected).into_iter().collect();
        for cell in self.manager.tracked_cells() {
            if !infected.contains(&cell) {
                self.manager.detach(cell);
                report.detached += 1;
            }
        }
        for &cell in &infected {
            if !self.manager.is_tracked(cell) {
                for network in &self.cell_networks {
                    self.manager.attach(cell, network)?;
                }
                report.attached += 1;
            }
        }
        Ok(())
    }

    fn integrate(&mut self) -> Result<()> {
        let dt = self.dt();
        self.reference.advance(&self.integrator, dt)?;
        self.manager.advance_all(&self.integrator, dt)
    }

    fn kill<P: CellPopulation + ?Sized>(&mut self, cell: CellId, host: &mut P, report: &mut StepReport) {
        host.set_kind(cell, CellKind::Dead);
        self.manager.detach(cell);
        report.deaths += 1;
        report.detached += 1;
        report.killed.push(cell);
    }

    fn live_fraction(&self, live: usize) -> f64 {
        if self.initial_infected == 0 {
            0.0
        } else {
            live as f64 / self.initial_infected as f64
        }
    }

    fn record_reference(&mut self, t: Time) -> Result<()> {
        for name in ["V", "P", "IFNe", "STATP", "IRF7", "IRF7P", "IFN"] {
            let value = self.reference.get(name)?;
            self.traces.record(&format!("ode_{}", name), t, value);
        }
        Ok(())
    }

    fn record_field(&mut self, t: Time, seen: f64) {
        self.traces.record("field_total", t, self.field.total());
        self.traces.record("field_seen", t, seen);
    }
}

// ============================================================================
// COUPLED SCENARIO
// ============================================================================

/// Per-cell viral and IFN models exchanging IFN through the field
#[derive(Debug, Clone)]
pub struct CoupledModel {
    core: ModelCore,
}

impl CoupledModel {
    pub fn new(config: SimulationConfig) -> Result<Self> {
        let core = ModelCore::new(
            config,
            models::ifn_model()?,
            vec![models::viral_model()?, models::ifn_submodel()?],
            DeathRule::InfectedFraction,
        )?;
        Ok(Self { core })
    }

    pub fn core(&self) -> &ModelCore {
        &self.core
    }

    fn sample_deaths<H: Host>(&mut self, host: &mut H, report: &mut StepReport) -> Result<()> {
        for cell in host.cells_of_kind(CellKind::Infected) {
            let dies = match self.core.manager.get(cell, models::VIRAL_MODEL) {
                Ok(instance) => self.core.policy.maybe_kill(cell, instance)?,
                Err(e) => {
                    report.skip(e, cell)?;
                    continue;
                }
            };
            if dies {
                self.core.kill(cell, host, report);
            }
        }
        Ok(())
    }

    fn couple_inputs<H: Host>(&mut self, cell: CellId, host: &H) -> Result<()> {
        let manager = &mut self.core.manager;
        let (v, p, ifne, ifn) = if self.core.config.feedback_enabled {
            let viral = manager.get(cell, models::VIRAL_MODEL)?;
            let ifn = manager.get(cell, models::IFN_SUBMODEL)?.get("IFN")?;
            (viral.get("V")?, viral.get("P")?, host.amount_seen_by_cell(cell), ifn)
        } else {
            let reference = &self.core.reference;
            (
                reference.get("V")?,
                reference.get("P")?,
                reference.get("IFNe")?,
                reference.get("IFN")?,
            )
        };

        let signaling = manager.get_mut(cell, models::IFN_SUBMODEL)?;
        signaling.set("V", v)?;
        signaling.set("P", p)?;
        signaling.set("IFNe", ifne)?;
        manager.get_mut(cell, models::VIRAL_MODEL)?.set("IFN", ifn)
    }

    fn secrete<H: Host>(&mut self, host: &mut H, report: &mut StepReport) -> Result<()> {
        let k21 = self.core.per_step("k21")?;
        for cell in host.cells_of_kind(CellKind::Infected) {
            let ifn = match self.core.manager.get(cell, models::IFN_SUBMODEL) {
                Ok(instance) => instance.get("IFN")?,
                Err(e) => {
                    report.skip(e, cell)?;
                    continue;
                }
            };
            let volume = host.volume(cell);
            if volume <= 0.0 {
                log::warn!("step {}: cell {} has volume {}, not secreting", report.mcs, cell, volume);
                continue;
            }
            let released = host.secrete_inside_cell_total_count(cell, k21 * ifn / volume);
            self.core.field.secrete(released);
            report.secreted += released;
        }
        Ok(())
    }
}

impl CellularModel for CoupledModel {
    fn on_simulation_start<H: Host>(&mut self, host: &mut H) -> Result<()> {
        host.set_decay_rate(self.core.decay_per_step("k73")?);
        self.core.decay_per_step("t2")?;
        self.core.initial_infected = host.cells_of_kind(CellKind::Infected).len();
        let mut report = StepReport::default();
        self.core.reconcile(&*host, &mut report)?;
        log::info!(
            "coupled scenario: {} infected cells, {} instances, feedback {}",
            self.core.initial_infected,
            self.core.manager.instance_count(),
            if self.core.config.feedback_enabled { "on" } else { "off" }
        );
        Ok(())
    }

    fn on_step<H: Host>(&mut self, mcs: u64, host: &mut H) -> Result<StepReport> {
        let t = self.core.clock.hours_at(mcs);
        let mut report = StepReport {
            mcs,
            hours: t,
            ..Default::default()
        };

        self.core.reconcile(&*host, &mut report)?;
        self.core.integrate()?;
        self.core.field.begin_step();

        self.sample_deaths(host, &mut report)?;

        for cell in host.cells_of_kind(CellKind::Infected) {
            if let Err(e) = self.couple_inputs(cell, &*host) {
                report.skip(e, cell)?;
            }
        }

        self.secrete(host, &mut report)?;
        let t2 = self.core.per_step("t2")?;
        report.decayed = self.core.field.apply_decay(t2);
        self.core.field.ensure_finite()?;

        let live = host.cells_of_kind(CellKind::Infected);
        report.field_seen = live.iter().map(|&c| host.amount_seen_by_cell(c)).sum();
        report.field_total = self.core.field.total();
        report.mean_v = self.core.manager.mean(models::VIRAL_MODEL, "V")?;
        report.count_population(&*host);

        if self.core.config.plot_ode_traces {
            self.core.record_reference(t)?;
        }
        if self.core.config.plot_cell_averages {
            let manager = &self.core.manager;
            let averages = [
                ("cell_V", manager.mean(models::VIRAL_MODEL, "V")?),
                ("cell_P", manager.mean(models::VIRAL_MODEL, "P")?),
                ("cell_STATP", manager.mean(models::IFN_SUBMODEL, "STATP")?),
                ("cell_IRF7", manager.mean(models::IFN_SUBMODEL, "IRF7")?),
                ("cell_IRF7P", manager.mean(models::IFN_SUBMODEL, "IRF7P")?),
                ("cell_IFN", manager.mean(models::IFN_SUBMODEL, "IFN")?),
            ];
            for (name, value) in averages {
                self.core.traces.record(name, t, value);
            }
            let fraction = self.core.live_fraction(live.len());
            self.core.traces.record("live_fraction", t, fraction);
        }
        if self.core.config.plot_ode_traces || self.core.config.plot_cell_averages {
            self.core.record_field(t, report.field_seen);
        }

        log::debug!(
            "step {}: {} infected, {} deaths, field {:.4e}",
            mcs,
            report.infected,
            report.deaths,
            report.field_total
        );
        Ok(report)
    }
}

// ============================================================================
// LUMPED SCENARIO
// ============================================================================

/// Reference model drives secretion and death; cells carry an IRF7 submodel
#[derive(Debug, Clone)]
pub struct LumpedModel {
    core: ModelCore,
}

impl LumpedModel {
    pub fn new(config: SimulationConfig) -> Result<Self> {
        let core = ModelCore::new(
            config,
            models::lumped_model()?,
            vec![models::irf7_submodel()?],
            DeathRule::ViralLoad,
        )?;
        Ok(Self { core })
    }

    pub fn core(&self) -> &ModelCore {
        &self.core
    }
}

impl CellularModel for LumpedModel {
    fn on_simulation_start<H: Host>(&mut self, host: &mut H) -> Result<()> {
        host.set_decay_rate(self.core.decay_per_step("t2")?);
        self.core.initial_infected = host.cells_of_kind(CellKind::Infected).len();
        let mut report = StepReport::default();
        self.core.reconcile(&*host, &mut report)?;
        log::info!(
            "lumped scenario: {} infected cells, {} instances",
            self.core.initial_infected,
            self.core.manager.instance_count()
        );
        Ok(())
    }

    fn on_step<H: Host>(&mut self, mcs: u64, host: &mut H) -> Result<StepReport> {
        let t = self.core.clock.hours_at(mcs);
        let mut report = StepReport {
            mcs,
            hours: t,
            ..Default::default()
        };

        self.core.reconcile(&*host, &mut report)?;
        self.core.integrate()?;
        self.core.field.begin_step();

        let k21 = self.core.per_step("k21")?;
        let ifn_per_cell = if self.core.initial_infected == 0 {
            0.0
        } else {
            self.core.reference.get("IFN")? / self.core.initial_infected as f64
        };

        for cell in host.cells_of_kind(CellKind::Infected) {
            let volume = host.volume(cell);
            if volume > 0.0 {
                let released = host
                    .secrete_inside_cell_total_count(cell, k21 * ifn_per_cell / volume)
                    .abs();
                self.core.field.secrete(released);
                report.secreted += released;
            } else {
                log::warn!("step {}: cell {} has volume {}, not secreting", mcs, cell, volume);
            }

            if self.core.policy.maybe_kill(cell, &self.core.reference)? {
                self.core.kill(cell, host, &mut report);
            }
        }

        let t2 = self.core.per_step("t2")?;
        report.decayed = self.core.field.apply_decay(t2);
        self.core.field.ensure_finite()?;

        let live = host.cells_of_kind(CellKind::Infected);
        let fraction = self.core.live_fraction(live.len());
        let statp = self.core.reference.get("STATP")? * fraction;
        let irf7p = self.core.reference.get("IRF7P")? * fraction;
        for &cell in &live {
            match self.core.manager.get_mut(cell, models::IRF7_SUBMODEL) {
                Ok(submodel) => {
                    submodel.set("STATP", statp)?;
                    submodel.set("IRF7P", irf7p)?;
                }
                Err(e) => report.skip(e, cell)?,
            }
        }

        report.field_seen = live.iter().map(|&c| host.amount_seen_by_cell(c)).sum();
        report.field_total = self.core.field.total();
        report.mean_v = self.core.reference.get("V")?;
        report.count_population(&*host);

        if self.core.config.plot_ode_traces {
            self.core.record_reference(t)?;
        }
        if self.core.config.plot_cell_averages {
            let irf7 = self.core.manager.mean(models::IRF7_SUBMODEL, "IRF7")?;
            self.core.traces.record("cell_IRF7", t, irf7);
            self.core.traces.record("live_fraction", t, fraction);
        }
        if self.core.config.plot_ode_traces || self.core.config.plot_cell_averages {
            self.core.record_field(t, report.field_seen);
        }

        log::debug!(
            "step {}: {} infected, {} deaths, field {:.4e}",
            mcs,
            report.infected,
            report.deaths,
            report.field_total
        );
        Ok(report)
    }
}

/// Scenario selected by configuration
#[derive(Debug, Clone)]
pub enum ScenarioModel {
    Coupled(CoupledModel),
    Lumped(LumpedModel),
}

impl ScenarioModel {
    pub fn from_config(config: SimulationConfig) -> Result<Self> {
        Ok(match config.scenario {
            Scenario::Coupled => Self::Coupled(CoupledModel::new(config)?),
            Scenario::Lumped => Self::Lumped(LumpedModel::new(config)?),
        })
    }

    pub fn core(&self) -> &ModelCore {
        match self {
            Self::Coupled(m) => m.core(),
            Self::Lumped(m) => m.core(),
        }
    }
}

impl CellularModel for ScenarioModel {
    fn on_simulation_start<H: Host>(&mut self, host: &mut H) -> Result<()> {
        match self {
            Self::Coupled(m) => m.on_simulation_start(host),
            Self::Lumped(m) => m.on_simulation_start(host),
        }
    }

    fn on_step<H: Host>(&mut self, mcs: u64, host: &mut H) -> Result<StepReport> {
        match self {
            Self::Coupled(m) => m.on_step(mcs, host),
            Self::Lumped(m) => m.on_step(mcs, host),
        }
    }
}

// ============================================================================
// REFERENCE HOST
// ============================================================================

/// One host-side cell
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TissueCell {
    pub kind: CellKind,
    pub volume: f64,
}

/// Scalar extracellular field, instantly mixed over the domain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WellMixedField {
    pub total: f64,
    pub decay_per_step: f64,
    pub domain_volume: f64,
}

impl WellMixedField {
    pub fn concentration(&self) -> f64 {
        if self.domain_volume > 0.0 {
            self.total / self.domain_volume
        } else {
            0.0
        }
    }
}

/// In-memory host without spatial structure
#[derive(Debug, Clone, Default)]
pub struct Tissue {
    cells: BTreeMap<CellId, TissueCell>,
    field: WellMixedField,
    next_id: CellId,
}

impl Tissue {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    /// `n_cells` cells of equal volume, the first `n_infected` infected
    pub fn monolayer(n_cells: usize, n_infected: usize, volume: f64) -> Self {
        let mut tissue = Self::new();
        for i in 0..n_cells {
            let kind = if i < n_infected {
                CellKind::Infected
            } else {
                CellKind::Uninfected
            };
            tissue.add_cell(kind, volume);
        }
        tissue
    }

    /// Add a cell; the field domain grows with it
    pub fn add_cell(&mut self, kind: CellKind, volume: f64) -> CellId {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        self.cells.insert(id, TissueCell { kind, volume });
        self.field.domain_volume += volume;
        id
    }

    pub fn cell(&self, id: CellId) -> Option<&TissueCell> {
        self.cells.get(&id)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn count(&self, kind: CellKind) -> usize {
        self.cells.values().filter(|c| c.kind == kind).count()
    }

    pub fn field(&self) -> &WellMixedField {
        &self.field
    }
}

impl CellPopulation for Tissue {
    fn cells_of_kind(&self, kind: CellKind) -> Vec<CellId> {
        self.cells
            .iter()
            .filter(|(_, c)| c.kind == kind)
            .map(|(&id, _)| id)
            .collect()
    }

    fn volume(&self, cell: CellId) -> f64 {
        self.cells.get(&cell).map_or(0.0, |c| c.volume)
    }

    fn set_kind(&mut self, cell: CellId, kind: CellKind) {
        if let Some(c) = self.cells.get_mut(&cell) {
            c.kind = kind;
        }
    }
}

impl FieldSecretor for Tissue {
    fn secrete_inside_cell_total_count(&mut self, cell: CellId, amount_per_volume: f64) -> f64 {
        let amount = amount_per_volume * self.volume(cell);
        self.field.total += amount;
        amount
    }

    fn amount_seen_by_cell(&self, cell: CellId) -> f64 {
        self.field.concentration() * self.volume(cell)
    }

    fn set_decay_rate(&mut self, per_step: f64) {
        self.field.decay_per_step = per_step;
    }

    fn relax(&mut self) {
        self.field.total -= self.field.decay_per_step * self.field.total;
    }
}

// ============================================================================
// SIMULATION DRIVER
// ============================================================================

/// Outcome of a full run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub steps: u64,
    pub hours: f64,
    pub deaths: usize,
    pub final_field_total: f64,
    pub field_balance: f64,
    /// (mcs, cell) in the order deaths were sampled
    pub death_events: Vec<(u64, CellId)>,
    pub reports: Vec<StepReport>,
}

/// Drives a [`CellularModel`] against a host for a configured duration
pub struct Simulation<H: Host> {
    model: ScenarioModel,
    host: H,
    steps: u64,
    started: bool,
}

impl<H: Host> Simulation<H> {
    pub fn new(config: SimulationConfig, host: H) -> Result<Self> {
        let steps = config.total_steps();
        Ok(Self {
            model: ScenarioModel::from_config(config)?,
            host,
            steps,
            started: false,
        })
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn model(&self) -> &ScenarioModel {
        &self.model
    }

    pub fn traces(&self) -> &Traces {
        &self.model.core().traces
    }

    pub fn start(&mut self) -> Result<()> {
        if !self.started {
            self.model.on_simulation_start(&mut self.host)?;
            self.started = true;
        }
        Ok(())
    }

    /// Run one host step
    pub fn step(&mut self, mcs: u64) -> Result<StepReport> {
        self.start()?;
        self.host.relax();
        self.model.on_step(mcs, &mut self.host)
    }

    /// Run every step, handing each report to `on_report`
    pub fn run<F: FnMut(&StepReport)>(&mut self, mut on_report: F) -> Result<RunSummary> {
        self.start()?;
        let mut summary = RunSummary::default();
        for mcs in 1..=self.steps {
            let report = self.step(mcs)?;
            on_report(&report);
            summary.deaths += report.deaths;
            summary
                .death_events
                .extend(report.killed.iter().map(|&cell| (mcs, cell)));
            summary.reports.push(report);
        }
        let core = self.model.core();
        summary.steps = self.steps;
        summary.hours = core.clock.hours_at(self.steps);
        summary.final_field_total = core.field.total();
        summary.field_balance = core.field.balance();
        log::info!(
            "finished {} steps ({:.1} h): {} deaths, field total {:.4e}",
            summary.steps,
            summary.hours,
            summary.deaths,
            summary.final_field_total
        );
        Ok(summary)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn viral_manager() -> InstanceManager {
        let mut manager = InstanceManager::new();
        manager.register(models::viral_model().unwrap());
        manager.register(models::ifn_submodel().unwrap());
        manager
    }

    #[test]
    fn test_attach_and_get() {
        let mut manager = viral_manager();
        manager.attach(1, models::VIRAL_MODEL).unwrap();
        manager.attach(1, models::IFN_SUBMODEL).unwrap();
        assert_eq!(manager.cell_count(), 1);
        assert_eq!(manager.instance_count(), 2);
        assert!((manager.get(1, "VModel").unwrap().get("V").unwrap() - 6.9e-8).abs() < 1e-20);

        assert!(matches!(
            manager.attach(1, models::VIRAL_MODEL),
            Err(VirosigError::AlreadyAttached { cell: 1, .. })
        ));
        assert!(matches!(
            manager.attach(2, "ODEModel"),
            Err(VirosigError::NetworkNotFound(_))
        ));
        assert!(!manager.is_tracked(2));
        assert!(matches!(
            manager.get(2, models::VIRAL_MODEL),
            Err(VirosigError::InstanceNotFound { cell: 2, .. })
        ));
    }

    #[test]
    fn test_detach_idempotent() {
        let mut manager = viral_manager();
        for cell in [3, 4] {
            manager.attach(cell, models::VIRAL_MODEL).unwrap();
            manager.attach(cell, models::IFN_SUBMODEL).unwrap();
        }
        assert_eq!(manager.detach(3), 2);
        let after_once = (manager.tracked_cells(), manager.instance_count());
        assert_eq!(manager.detach(3), 0);
        assert_eq!((manager.tracked_cells(), manager.instance_count()), after_once);
        assert_eq!(manager.tracked_cells(), vec![4]);
    }

    #[test]
    fn test_parameter_overrides_and_multipliers() {
        let mut manager = InstanceManager::new().with_parameters(
            [("k72".to_string(), 0.0), ("k31".to_string(), 10.0)].into(),
            [("k71".to_string(), 2.0)].into(),
        );
        manager.register(models::viral_model().unwrap());
        let instance = manager.attach(9, models::VIRAL_MODEL).unwrap();
        assert_eq!(instance.get("k72").unwrap(), 0.0);
        assert!((instance.get("k71").unwrap() - 3.074).abs() < 1e-12);
        assert!(!instance.has("k31"));
    }

    #[test]
    fn test_advance_all_tags_cell() {
        let mut manager = viral_manager();
        manager.attach(5, models::VIRAL_MODEL).unwrap();
        manager.get_mut(5, models::VIRAL_MODEL).unwrap().set("V", f64::INFINITY).unwrap();
        let err = manager
            .advance_all(&FixedStepIntegrator::default(), 1.0 / 6.0)
            .unwrap_err();
        assert!(matches!(err, VirosigError::NonFinite { cell: Some(5), .. }));
    }

    #[test]
    fn test_field_ledger() {
        let mut field = ExtracellularField::new(2.0);
        field.begin_step();
        field.secrete(1.0);
        field.secrete(0.5);
        // decay uses the start-of-step total, not the post-secretion one
        let decayed = field.apply_decay(0.25);
        assert!((decayed - 0.5).abs() < 1e-12);
        assert!((field.total() - 3.0).abs() < 1e-12);
        assert!(field.balance().abs() < 1e-12);
        assert!(field.ensure_finite().is_ok());

        field.secrete(f64::NAN);
        assert!(field.ensure_finite().is_err());
    }

    #[test]
    fn test_death_probability() {
        let dt = 1.0 / 6.0;
        let network = Arc::new(models::viral_model().unwrap());
        let mut instance = ModelInstance::new(network);
        instance.set("V", 3.0).unwrap();
        instance.set("P", 0.4).unwrap();

        let fraction = DeathPolicy::new(DeathRule::InfectedFraction, dt, 1);
        let expected = 0.635 * dt * 3.0 * 0.6;
        assert!((fraction.probability(&instance).unwrap() - expected).abs() < 1e-12);

        let load = DeathPolicy::new(DeathRule::ViralLoad, dt, 1);
        assert!((load.probability(&instance).unwrap() - 0.635 * dt * 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_death_policy_unclamped() {
        let mut instance = ModelInstance::new(Arc::new(models::viral_model().unwrap()));
        instance.set("V", 1e6).unwrap();
        let mut policy = DeathPolicy::new(DeathRule::ViralLoad, 1.0 / 6.0, 7);
        assert!(policy.probability(&instance).unwrap() > 1.0);
        for cell in 0..100 {
            assert!(policy.maybe_kill(cell, &instance).unwrap());
        }
        assert_eq!(policy.draws(), 100);

        // P = 1 means zero probability under the infected-fraction rule
        instance.set("P", 1.0).unwrap();
        let mut policy = DeathPolicy::new(DeathRule::InfectedFraction, 1.0 / 6.0, 7);
        assert!(!(0..100).any(|cell| policy.maybe_kill(cell, &instance).unwrap()));
        assert_eq!(policy.draws(), 100);
    }

    #[test]
    fn test_death_policy_seeded() {
        let mut instance = ModelInstance::new(Arc::new(models::viral_model().unwrap()));
        instance.set("V", 2.0).unwrap();
        let outcomes = |seed| {
            let mut policy = DeathPolicy::new(DeathRule::ViralLoad, 1.0 / 6.0, seed);
            (0..200)
                .map(|cell| policy.maybe_kill(cell, &instance).unwrap())
                .collect::<Vec<_>>()
        };
        let a = outcomes(42);
        assert_eq!(a, outcomes(42));
        // p ≈ 0.21: some but not all cells die
        assert!(a.iter().any(|&d| d) && !a.iter().all(|&d| d));
    }

    #[test]
    fn test_config_json() {
        let config = SimulationConfig::from_json_str(
            r#"{"scenario": "lumped", "seed": 7, "integrator": {"method": "heun"}}"#,
        )
        .unwrap();
        assert_eq!(config.scenario, Scenario::Lumped);
        assert_eq!(config.seed, 7);
        assert_eq!(config.integrator.substeps, 4);
        assert_eq!(config.minutes_per_step, 10.0);

        let round = SimulationConfig::from_json_str(&config.to_json_string().unwrap()).unwrap();
        assert_eq!(round, config);

        assert!(matches!(
            SimulationConfig::from_json_str(r#"{"minutes_per_step": 0}"#),
            Err(VirosigError::ConfigError(_))
        ));
        assert!(SimulationConfig::from_json_str("{not json").is_err());
    }

    #[test]
    fn test_config_presets() {
        assert_eq!(SimulationConfig::coupled().total_steps(), 1440);
        assert_eq!(SimulationConfig::lumped().total_steps(), 108);

        let mut config = SimulationConfig::coupled();
        config.integrator.substeps = 0;
        assert!(config.validate().is_err());

        let mut config = SimulationConfig::coupled();
        config.parameter_multipliers.insert("k31".into(), f64::NAN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tissue_host() {
        let mut tissue = Tissue::monolayer(4, 2, 2.0);
        assert_eq!(tissue.cells_of_kind(CellKind::Infected), vec![1, 2]);
        assert_eq!(tissue.count(CellKind::Uninfected), 2);

        let released = tissue.secrete_inside_cell_total_count(1, 0.5);
        assert!((released - 1.0).abs() < 1e-12);
        // one unit over a domain of 8, seen by a cell of volume 2
        assert!((tissue.amount_seen_by_cell(2) - 0.25).abs() < 1e-12);

        tissue.set_decay_rate(0.5);
        tissue.relax();
        assert!((tissue.field().total - 0.5).abs() < 1e-12);

        tissue.set_kind(2, CellKind::Dead);
        assert_eq!(tissue.cells_of_kind(CellKind::Dead), vec![2]);
        assert_eq!(tissue.volume(99), 0.0);
    }

    #[test]
    fn test_reconcile_follows_host() {
        let mut config = SimulationConfig::coupled();
        config.duration_hours = 1.0;
        let mut sim = Simulation::new(config, Tissue::monolayer(3, 2, 1.0)).unwrap();
        sim.start().unwrap();
        assert_eq!(sim.model().core().manager.tracked_cells(), vec![1, 2]);

        sim.host_mut().set_kind(3, CellKind::Infected);
        sim.host_mut().set_kind(1, CellKind::Dead);
        let report = sim.step(1).unwrap();
        assert_eq!(report.attached, 1);
        assert!(report.detached >= 1);
        let manager = &sim.model().core().manager;
        assert!(!manager.is_tracked(1));
        assert!(manager.is_tracked(3));
        assert_eq!(manager.instance_count(), 2 * manager.cell_count());
    }

    /// Host that never lets a cell die
    #[derive(Debug, Clone)]
    struct UndyingTissue(Tissue);

    impl CellPopulation for UndyingTissue {
        fn cells_of_kind(&self, kind: CellKind) -> Vec<CellId> {
            self.0.cells_of_kind(kind)
        }

        fn volume(&self, cell: CellId) -> f64 {
            self.0.volume(cell)
        }

        fn set_kind(&mut self, cell: CellId, kind: CellKind) {
            if kind != CellKind::Dead {
                self.0.set_kind(cell, kind);
            }
        }
    }

    impl FieldSecretor for UndyingTissue {
        fn secrete_inside_cell_total_count(&mut self, cell: CellId, amount_per_volume: f64) -> f64 {
            self.0.secrete_inside_cell_total_count(cell, amount_per_volume)
        }

        fn amount_seen_by_cell(&self, cell: CellId) -> f64 {
            self.0.amount_seen_by_cell(cell)
        }

        fn set_decay_rate(&mut self, per_step: f64) {
            self.0.set_decay_rate(per_step);
        }

        fn relax(&mut self) {
            self.0.relax();
        }
    }

    #[test]
    fn test_missing_instances_are_skipped() {
        // k61·Δt·V is well above 1 after one step, so every cell is killed
        let config = SimulationConfig {
            duration_hours: 1.0,
            parameter_overrides: [("k61".to_string(), 5e8)].into(),
            ..SimulationConfig::coupled()
        };
        let mut sim = Simulation::new(config, UndyingTissue(Tissue::monolayer(3, 3, 1.0))).unwrap();

        let report = sim.step(1).unwrap();
        assert_eq!(report.killed, vec![1, 2, 3]);
        assert_eq!(report.infected, 3);
        assert_eq!(report.dead, 0);
        // once in input coupling, once in secretion
        assert_eq!(report.skipped, 6);
        assert_eq!(report.skipped_cells, vec![1, 2, 3, 1, 2, 3]);
        assert_eq!(report.secreted, 0.0);
        assert_eq!(sim.model().core().manager.cell_count(), 0);

        // the next step re-attaches the cells the host still calls infected
        let report = sim.step(2).unwrap();
        assert_eq!(report.attached, 3);
    }

    #[test]
    fn test_decay_fraction_per_step() {
        let mut coupled = CoupledModel::new(SimulationConfig::coupled()).unwrap();
        let mut tissue = Tissue::monolayer(2, 2, 1.0);
        coupled.on_simulation_start(&mut tissue).unwrap();
        let k73 = coupled.core.decay_per_step("k73").unwrap();
        assert!((tissue.field().decay_per_step - k73).abs() < 1e-15);
        assert!(coupled.core.decay_per_step("t2").unwrap() < 1.0);

        // 20 min steps push t2 past one full decay per step
        let mut lumped = LumpedModel::new(SimulationConfig::lumped()).unwrap();
        let mut tissue = Tissue::monolayer(2, 2, 1.0);
        lumped.on_simulation_start(&mut tissue).unwrap();
        let t2 = lumped.core.decay_per_step("t2").unwrap();
        assert!(t2 > 1.0);
        assert_eq!(tissue.field().decay_per_step, t2);
    }
}
