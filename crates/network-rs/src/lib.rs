//! # Network-RS
//!
//! Typed reaction networks for intracellular interferon / virus models.
//!
//! ## Background
//!
//! The published models are written as reaction lists with infix rate laws:
//!
//! ```text
//! E8a: -> V ; P*(k71*V)/(1.0+k72*IFN*7E-5)
//! ```
//!
//! Every rate law is parsed once, when its network is built, into an
//! expression tree whose identifiers are already resolved to species or
//! parameter slots. All per-cell instances of a network share that template
//! through an `Arc` and only own their state vector and a private parameter
//! copy.
//!
//! ## Features
//!
//! 1. **Rate-law parser**: `+ - * / ^`, unary minus, parentheses, literals
//! 2. **Stoichiometry**: species × reactions matrix, `dS/dt = N · v`
//! 3. **Fixed-step integration**: Euler, Heun, classical RK4 with substeps
//! 4. **Model instances**: named get/set for coupling, finite-value checks
//! 5. **Built-in models**: Weaver & Shoemaker IFN/virus networks and submodels

use ndarray::{Array1, Array2};
use pest::iterators::Pairs;
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use virosig_core::{OdeSystem, Result, StateVector, Time, VirosigError};

// =============================================================================
// RATE-LAW PARSER
// =============================================================================

#[derive(Parser)]
#[grammar_inline = r#"
WHITESPACE = _{ " " | "\t" | "\r" | "\n" }

number = @{
    (ASCII_DIGIT+ ~ ("." ~ ASCII_DIGIT*)? | "." ~ ASCII_DIGIT+)
    ~ (("e" | "E") ~ ("+" | "-")? ~ ASCII_DIGIT+)?
}
identifier = @{ (ASCII_ALPHA | "_") ~ (ASCII_ALPHANUMERIC | "_")* }

add = { "+" }
sub = { "-" }
mul = { "*" }
div = { "/" }
pow = { "^" }
neg = { "-" }

infix = _{ add | sub | mul | div | pow }
primary = _{ number | identifier | "(" ~ expr ~ ")" }
atom = _{ neg? ~ primary }
expr = { atom ~ (infix ~ atom)* }
rate_law = _{ SOI ~ expr ~ EOI }
"#]
struct RateLawParser;

fn pratt() -> &'static PrattParser<Rule> {
    static PRATT: OnceLock<PrattParser<Rule>> = OnceLock::new();
    PRATT.get_or_init(|| {
        PrattParser::new()
            .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::sub, Assoc::Left))
            .op(Op::infix(Rule::mul, Assoc::Left) | Op::infix(Rule::div, Assoc::Left))
            .op(Op::prefix(Rule::neg))
            .op(Op::infix(Rule::pow, Assoc::Right))
    })
}

fn build_expr(pairs: Pairs<'_, Rule>) -> Result<Expr<String>> {
    pratt()
        .map_primary(|primary| match primary.as_rule() {
            Rule::number => primary
                .as_str()
                .parse::<f64>()
                .map(Expr::Const)
                .map_err(|e| {
                    VirosigError::ParseError(format!("bad literal {}: {}", primary.as_str(), e))
                }),
            Rule::identifier => Ok(Expr::Var(primary.as_str().to_string())),
            Rule::expr => build_expr(primary.into_inner()),
            rule => Err(VirosigError::ParseError(format!(
                "unexpected {:?} in rate law",
                rule
            ))),
        })
        .map_prefix(|op, rhs| match op.as_rule() {
            Rule::neg => Ok(Expr::Neg(Box::new(rhs?))),
            rule => Err(VirosigError::ParseError(format!(
                "unexpected prefix {:?}",
                rule
            ))),
        })
        .map_infix(|lhs, op, rhs| {
            let op = match op.as_rule() {
                Rule::add => BinOp::Add,
                Rule::sub => BinOp::Sub,
                Rule::mul => BinOp::Mul,
                Rule::div => BinOp::Div,
                Rule::pow => BinOp::Pow,
                rule => {
                    return Err(VirosigError::ParseError(format!(
                        "unexpected operator {:?}",
                        rule
                    )))
                }
            };
            Ok(Expr::Binary(op, Box::new(lhs?), Box::new(rhs?)))
        })
        .parse(pairs)
}

// =============================================================================
// EXPRESSION TREES
// =============================================================================

/// Binary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinOp {
    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Pow => a.powf(b),
        }
    }
}

/// Rate expression, generic over how variables are referenced
///
/// `Expr<String>` is what the parser produces; `Expr<Slot>` is what a built
/// network evaluates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr<V> {
    Const(f64),
    Var(V),
    Neg(Box<Expr<V>>),
    Binary(BinOp, Box<Expr<V>>, Box<Expr<V>>),
}

impl Expr<String> {
    /// Parse an infix rate law
    pub fn parse(source: &str) -> Result<Self> {
        let mut pairs = RateLawParser::parse(Rule::rate_law, source)
            .map_err(|e| VirosigError::ParseError(format!("{}: {}", source.trim(), e)))?;
        let expr = pairs
            .next()
            .ok_or_else(|| VirosigError::ParseError(format!("empty rate law: {:?}", source)))?;
        build_expr(expr.into_inner())
    }
}

impl<V> Expr<V> {
    /// Map every variable reference through `f`
    pub fn resolve<W, F>(&self, f: &mut F) -> Result<Expr<W>>
    where
        F: FnMut(&V) -> Result<W>,
    {
        Ok(match self {
            Self::Const(c) => Expr::Const(*c),
            Self::Var(v) => Expr::Var(f(v)?),
            Self::Neg(inner) => Expr::Neg(Box::new(inner.resolve(f)?)),
            Self::Binary(op, a, b) => {
                Expr::Binary(*op, Box::new(a.resolve(f)?), Box::new(b.resolve(f)?))
            }
        })
    }

    /// Variables referenced, in order of appearance (with repeats)
    pub fn variables(&self) -> Vec<&V> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables<'a>(&'a self, out: &mut Vec<&'a V>) {
        match self {
            Self::Const(_) => {}
            Self::Var(v) => out.push(v),
            Self::Neg(inner) => inner.collect_variables(out),
            Self::Binary(_, a, b) => {
                a.collect_variables(out);
                b.collect_variables(out);
            }
        }
    }
}

/// Resolved variable reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    Species(usize),
    Parameter(usize),
}

impl Expr<Slot> {
    /// Evaluate against a state vector and parameter values
    pub fn eval(&self, species: &[f64], parameters: &[f64]) -> f64 {
        match self {
            Self::Const(c) => *c,
            Self::Var(Slot::Species(i)) => species[*i],
            Self::Var(Slot::Parameter(i)) => parameters[*i],
            Self::Neg(inner) => -inner.eval(species, parameters),
            Self::Binary(op, a, b) => op.apply(a.eval(species, parameters), b.eval(species, parameters)),
        }
    }
}

// =============================================================================
// REACTION NETWORK
// =============================================================================

/// One reaction with its compiled rate law
#[derive(Debug, Clone, Serialize)]
pub struct Reaction {
    pub id: String,
    /// (species index, stoichiometry)
    pub reactants: Vec<(usize, f64)>,
    pub products: Vec<(usize, f64)>,
    pub rate: Expr<Slot>,
    /// Rate law as written
    pub rate_source: String,
}

/// Immutable network template shared by every instance
#[derive(Debug, Clone, Serialize)]
pub struct ReactionNetwork {
    name: String,
    species: Vec<String>,
    initial: Vec<f64>,
    parameter_names: Vec<String>,
    parameter_values: Vec<f64>,
    reactions: Vec<Reaction>,
    stoichiometry: Array2<f64>,
    #[serde(skip)]
    index: HashMap<String, Slot>,
}

impl ReactionNetwork {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Species names in state-vector order
    pub fn species(&self) -> &[String] {
        &self.species
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }

    /// Species × reactions stoichiometry matrix
    pub fn stoichiometry_matrix(&self) -> &Array2<f64> {
        &self.stoichiometry
    }

    pub fn slot(&self, name: &str) -> Option<Slot> {
        self.index.get(name).copied()
    }

    pub fn species_index(&self, name: &str) -> Option<usize> {
        match self.slot(name) {
            Some(Slot::Species(i)) => Some(i),
            _ => None,
        }
    }

    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        match self.slot(name) {
            Some(Slot::Parameter(i)) => Some(i),
            _ => None,
        }
    }

    /// Template value of a parameter
    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.parameter_index(name).map(|i| self.parameter_values[i])
    }

    pub fn initial_state(&self) -> StateVector {
        Array1::from_vec(self.initial.clone())
    }

    pub fn default_parameters(&self) -> Vec<f64> {
        self.parameter_values.clone()
    }

    /// Species no reaction produces or consumes; these are set by coupling
    pub fn inputs(&self) -> Vec<&str> {
        self.stoichiometry
            .outer_iter()
            .zip(&self.species)
            .filter(|(row, _)| row.iter().all(|&s| s == 0.0))
            .map(|(_, name)| name.as_str())
            .collect()
    }

    /// Flux of every reaction at the given state
    pub fn reaction_rates(&self, state: &StateVector, parameters: &[f64]) -> Array1<f64> {
        let species = state.to_vec();
        self.reactions
            .iter()
            .map(|r| r.rate.eval(&species, parameters))
            .collect()
    }

    /// dS/dt = N · v
    pub fn derivatives(&self, state: &StateVector, parameters: &[f64]) -> StateVector {
        let rates = self.reaction_rates(state, parameters);
        self.stoichiometry.dot(&rates)
    }
}

/// Builder for [`ReactionNetwork`]
///
/// Reactants and products may carry a leading coefficient (`"2 A"`).
#[derive(Debug, Clone)]
pub struct NetworkBuilder {
    name: String,
    reactions: Vec<(String, Vec<String>, Vec<String>, String)>,
    parameters: Vec<(String, f64)>,
    initial: Vec<(String, f64)>,
}

impl NetworkBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reactions: Vec::new(),
            parameters: Vec::new(),
            initial: Vec::new(),
        }
    }

    pub fn reaction(mut self, id: &str, reactants: &[&str], products: &[&str], rate: &str) -> Self {
        self.reactions.push((
            id.to_string(),
            reactants.iter().map(|s| s.to_string()).collect(),
            products.iter().map(|s| s.to_string()).collect(),
            rate.to_string(),
        ));
        self
    }

    pub fn parameter(mut self, name: &str, value: f64) -> Self {
        self.parameters.push((name.to_string(), value));
        self
    }

    pub fn parameters(mut self, values: &[(&str, f64)]) -> Self {
        for (name, value) in values {
            self.parameters.push((name.to_string(), *value));
        }
        self
    }

    /// Initial value; a name no reaction touches becomes an input species
    pub fn initial(mut self, name: &str, value: f64) -> Self {
        self.initial.push((name.to_string(), value));
        self
    }

    pub fn build(self) -> Result<ReactionNetwork> {
        let network = self.name.clone();
        let err = |msg: String| VirosigError::ParseError(format!("{}: {}", network, msg));

        let mut species: Vec<String> = Vec::new();
        let mut index: HashMap<String, Slot> = HashMap::new();
        let mut parsed_refs = Vec::with_capacity(self.reactions.len());

        for (id, reactants, products, _) in &self.reactions {
            let reactants = reactants
                .iter()
                .map(|s| parse_species_ref(s))
                .collect::<Result<Vec<_>>>()?;
            let products = products
                .iter()
                .map(|s| parse_species_ref(s))
                .collect::<Result<Vec<_>>>()?;
            for (name, _) in reactants.iter().chain(&products) {
                if !index.contains_key(name) {
                    index.insert(name.clone(), Slot::Species(species.len()));
                    species.push(name.clone());
                }
            }
            if parsed_refs.iter().any(|(other, _, _): &(String, _, _)| other == id) {
                return Err(err(format!("duplicate reaction id {}", id)));
            }
            parsed_refs.push((id.clone(), reactants, products));
        }

        for (name, _) in &self.initial {
            if !index.contains_key(name) {
                index.insert(name.clone(), Slot::Species(species.len()));
                species.push(name.clone());
            }
        }

        let mut parameter_names = Vec::with_capacity(self.parameters.len());
        let mut parameter_values = Vec::with_capacity(self.parameters.len());
        for (name, value) in &self.parameters {
            if index.contains_key(name) {
                return Err(err(format!("{} declared twice (species or parameter)", name)));
            }
            index.insert(name.clone(), Slot::Parameter(parameter_names.len()));
            parameter_names.push(name.clone());
            parameter_values.push(*value);
        }

        let mut initial = vec![0.0; species.len()];
        for (name, value) in &self.initial {
            if let Some(Slot::Species(i)) = index.get(name) {
                initial[*i] = *value;
            }
        }

        let mut stoichiometry = Array2::zeros((species.len(), self.reactions.len()));
        let mut reactions = Vec::with_capacity(self.reactions.len());

        for (j, ((id, reactants, products), (_, _, _, source))) in
            parsed_refs.into_iter().zip(&self.reactions).enumerate()
        {
            let rate = Expr::parse(source)?.resolve(&mut |name: &String| {
                index
                    .get(name)
                    .copied()
                    .ok_or_else(|| err(format!("unknown identifier {} in {}", name, id)))
            })?;

            let to_indexed = |refs: Vec<(String, f64)>| -> Vec<(usize, f64)> {
                refs.into_iter()
                    .filter_map(|(name, coeff)| match index.get(&name) {
                        Some(Slot::Species(i)) => Some((*i, coeff)),
                        _ => None,
                    })
                    .collect()
            };
            let reactants = to_indexed(reactants);
            let products = to_indexed(products);

            // Reactants (negative stoichiometry)
            for &(i, coeff) in &reactants {
                stoichiometry[[i, j]] -= coeff;
            }
            // Products (positive stoichiometry)
            for &(i, coeff) in &products {
                stoichiometry[[i, j]] += coeff;
            }

            reactions.push(Reaction {
                id,
                reactants,
                products,
                rate,
                rate_source: source.clone(),
            });
        }

        log::debug!(
            "built network {} ({} species, {} reactions, {} parameters)",
            self.name,
            species.len(),
            reactions.len(),
            parameter_names.len()
        );

        Ok(ReactionNetwork {
            name: self.name,
            species,
            initial,
            parameter_names,
            parameter_values,
            reactions,
            stoichiometry,
            index,
        })
    }
}

fn parse_species_ref(text: &str) -> Result<(String, f64)> {
    let mut parts = text.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) => Ok((name.to_string(), 1.0)),
        (Some(coeff), Some(name), None) => coeff
            .parse::<f64>()
            .map(|c| (name.to_string(), c))
            .map_err(|_| VirosigError::ParseError(format!("bad species reference {:?}", text))),
        _ => Err(VirosigError::ParseError(format!("bad species reference {:?}", text))),
    }
}

/// A network paired with one parameter set, as seen by an integrator
pub struct BoundNetwork<'a> {
    pub network: &'a ReactionNetwork,
    pub parameters: &'a [f64],
}

impl OdeSystem for BoundNetwork<'_> {
    fn dimension(&self) -> usize {
        self.network.species.len()
    }

    fn derivatives(&self, _t: Time, y: &StateVector) -> StateVector {
        self.network.derivatives(y, self.parameters)
    }
}

// =============================================================================
// INTEGRATOR
// =============================================================================

/// Explicit fixed-step method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationMethod {
    Euler,
    Heun,
    Rk4,
}

/// Integrator configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorConfig {
    pub method: IntegrationMethod,
    /// Equal sub-steps per `advance` call
    pub substeps: usize,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            method: IntegrationMethod::Rk4,
            substeps: 4,
        }
    }
}

/// Fixed-step explicit integrator; no step-size control
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedStepIntegrator {
    config: IntegratorConfig,
}

impl FixedStepIntegrator {
    pub fn new(config: IntegratorConfig) -> Self {
        Self { config }
    }

    /// Advance `y` from `t` by exactly `dt`
    pub fn advance<S: OdeSystem>(&self, system: &S, t: Time, y: &mut StateVector, dt: Time) {
        debug_assert_eq!(y.len(), system.dimension());
        let n = self.config.substeps.max(1);
        let h = dt / n as f64;
        let mut t = t;
        for _ in 0..n {
            self.step(system, t, y, h);
            t += h;
        }
    }

    fn step<S: OdeSystem>(&self, system: &S, t: Time, y: &mut StateVector, h: Time) {
        match self.config.method {
            IntegrationMethod::Euler => {
                let k1 = system.derivatives(t, y);
                y.scaled_add(h, &k1);
            }
            IntegrationMethod::Heun => {
                let k1 = system.derivatives(t, y);
                let k2 = system.derivatives(t + h, &(&*y + &(&k1 * h)));
                y.scaled_add(0.5 * h, &(&k1 + &k2));
            }
            IntegrationMethod::Rk4 => {
                let half = 0.5 * h;
                let k1 = system.derivatives(t, y);
                let k2 = system.derivatives(t + half, &(&*y + &(&k1 * half)));
                let k3 = system.derivatives(t + half, &(&*y + &(&k2 * half)));
                let k4 = system.derivatives(t + h, &(&*y + &(&k3 * h)));
                let slope = &k1 + &(&k2 * 2.0) + &(&k3 * 2.0) + &k4;
                y.scaled_add(h / 6.0, &slope);
            }
        }
    }
}

// =============================================================================
// MODEL INSTANCE
// =============================================================================

/// Mutable state of one network for one owner (a cell, or free-floating)
#[derive(Debug, Clone)]
pub struct ModelInstance {
    network: Arc<ReactionNetwork>,
    state: StateVector,
    parameters: Vec<f64>,
    time: Time,
}

impl ModelInstance {
    /// New instance at the template's initial conditions
    pub fn new(network: Arc<ReactionNetwork>) -> Self {
        let state = network.initial_state();
        let parameters = network.default_parameters();
        Self {
            network,
            state,
            parameters,
            time: 0.0,
        }
    }

    pub fn network(&self) -> &ReactionNetwork {
        &self.network
    }

    pub fn name(&self) -> &str {
        self.network.name()
    }

    pub fn time(&self) -> Time {
        self.time
    }

    pub fn state(&self) -> &StateVector {
        &self.state
    }

    pub fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    pub fn has(&self, name: &str) -> bool {
        self.network.slot(name).is_some()
    }

    /// Value of a species or parameter
    pub fn get(&self, name: &str) -> Result<f64> {
        match self.network.slot(name) {
            Some(Slot::Species(i)) => Ok(self.state[i]),
            Some(Slot::Parameter(i)) => Ok(self.parameters[i]),
            None => Err(self.unknown(name)),
        }
    }

    /// Assign a species or parameter (input coupling, overrides)
    pub fn set(&mut self, name: &str, value: f64) -> Result<()> {
        match self.network.slot(name) {
            Some(Slot::Species(i)) => self.state[i] = value,
            Some(Slot::Parameter(i)) => self.parameters[i] = value,
            None => return Err(self.unknown(name)),
        }
        Ok(())
    }

    /// Multiply a species or parameter in place
    pub fn scale(&mut self, name: &str, factor: f64) -> Result<()> {
        let value = self.get(name)?;
        self.set(name, value * factor)
    }

    /// Integrate forward by `dt` hours, then check for blow-up
    pub fn advance(&mut self, integrator: &FixedStepIntegrator, dt: Time) -> Result<()> {
        let system = BoundNetwork {
            network: &self.network,
            parameters: &self.parameters,
        };
        integrator.advance(&system, self.time, &mut self.state, dt);
        self.time += dt;
        self.ensure_finite()
    }

    /// Fails on the first NaN/inf species
    pub fn ensure_finite(&self) -> Result<()> {
        match self.state.iter().position(|x| !x.is_finite()) {
            Some(i) => Err(VirosigError::NonFinite {
                network: self.network.name().to_string(),
                variable: self.network.species[i].clone(),
                cell: None,
            }),
            None => Ok(()),
        }
    }

    fn unknown(&self, name: &str) -> VirosigError {
        VirosigError::UnknownVariable {
            network: self.network.name().to_string(),
            name: name.to_string(),
        }
    }
}

/// Time course of a free-floating instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    /// Time points
    pub time: Vec<f64>,
    /// Species names in column order
    pub species: Vec<String>,
    /// Species concentrations over time
    pub concentrations: HashMap<String, Vec<f64>>,
}

/// Run an instance for `n_steps` steps of `dt`, recording after every step
pub fn time_course(
    instance: &mut ModelInstance,
    integrator: &FixedStepIntegrator,
    dt: Time,
    n_steps: usize,
) -> Result<SimulationResult> {
    let species = instance.network().species().to_vec();
    let mut time = Vec::with_capacity(n_steps + 1);
    let mut concentrations: HashMap<String, Vec<f64>> = species
        .iter()
        .map(|s| (s.clone(), Vec::with_capacity(n_steps + 1)))
        .collect();

    let mut record = |instance: &ModelInstance, time: &mut Vec<f64>| {
        time.push(instance.time());
        for (name, value) in species.iter().zip(instance.state().iter()) {
            if let Some(column) = concentrations.get_mut(name) {
                column.push(*value);
            }
        }
    };

    record(instance, &mut time);
    for _ in 0..n_steps {
        instance.advance(integrator, dt)?;
        record(instance, &mut time);
    }

    Ok(SimulationResult {
        time,
        species,
        concentrations,
    })
}

// =============================================================================
// STANDARD MODELS
// =============================================================================

pub mod models {
    //! Weaver & Shoemaker, "Mathematical Modeling of RNA Virus Sensing
    //! Pathways Reveal Paracrine Signaling as the Primary Factor Regulating
    //! Excessive Cytokine Production". Rates are per hour.

    use super::*;

    /// Free-floating reference model of the coupled scenario
    pub const IFN_MODEL: &str = "IFNModel";
    /// Per-cell viral replication model
    pub const VIRAL_MODEL: &str = "VModel";
    /// Per-cell IFN signaling model
    pub const IFN_SUBMODEL: &str = "IModel";
    /// Free-floating reference model of the lumped scenario
    pub const LUMPED_MODEL: &str = "ODEModel";
    /// Per-cell IRF7 model of the lumped scenario
    pub const IRF7_SUBMODEL: &str = "submodel";

    /// Every built-in network name
    pub const ALL: [&str; 5] = [IFN_MODEL, VIRAL_MODEL, IFN_SUBMODEL, LUMPED_MODEL, IRF7_SUBMODEL];

    /// Fitted parameter values shared by every variant (t4 differs, see below)
    pub const PARAMETERS: [(&str, f64); 19] = [
        ("k11", 0.0),
        ("k12", 9.746),
        ("k13", 12.511),
        ("k14", 13.562),
        ("k21", 10.385),
        ("t2", 3.481),
        ("k31", 45.922),
        ("k32", 5.464),
        ("k33", 0.068),
        ("t3", 0.3),
        ("k41", 0.115),
        ("k42", 1.053),
        ("k51", 0.202),
        ("t5", 0.3),
        ("k61", 0.635),
        ("k71", 1.537),
        ("k72", 47.883),
        ("k73", 0.197),
        ("n", 3.0),
    ];

    /// IRF7 decay in the coupled scenario
    pub const T4_COUPLED: f64 = 0.75;
    /// IRF7 decay in the lumped scenario
    pub const T4_LUMPED: f64 = 0.3;
    /// Initial IRF7 in the lumped scenario
    pub const IRF7_LUMPED: f64 = 0.72205;
    /// Initial viral load
    pub const V0: f64 = 6.9e-8;

    fn subset(names: &[&str]) -> Vec<(&'static str, f64)> {
        PARAMETERS
            .iter()
            .filter(|(name, _)| names.contains(name))
            .copied()
            .collect()
    }

    fn full_model(name: &str, secretion: &str, t4: f64, irf7: f64) -> Result<ReactionNetwork> {
        NetworkBuilder::new(name)
            .reaction("E2a", &[], &["IFN"], "P*(k11*RIGI*V+k12*(V^n)/(k13+(V^n))+k14*IRF7P)")
            .reaction("E2b", &["IFN"], &["IFNe"], secretion)
            .reaction("E3a", &["IFNe"], &[], "t2*IFNe")
            .reaction("E4a", &[], &["STATP"], "P*k31*IFNe/(k32+k33*IFNe)")
            .reaction("E4b", &["STATP"], &[], "t3*STATP")
            .reaction("E5a", &[], &["IRF7"], "P*(k41*STATP+k42*IRF7P)")
            .reaction("E5b", &["IRF7"], &[], "t4*IRF7")
            .reaction("E6a", &[], &["IRF7P"], "P*k51*IRF7")
            .reaction("E6b", &["IRF7P"], &[], "t5*IRF7P")
            .reaction("E7a", &["P"], &[], "P*k61*V")
            .reaction("E8a", &[], &["V"], "P*(k71*V)/(1.0+k72*IFN*7E-5)")
            .reaction("E8b", &["V"], &[], "k73*V")
            .parameters(&PARAMETERS)
            .parameter("t4", t4)
            .initial("P", 1.0)
            .initial("RIGI", 1.0)
            .initial("IRF7", irf7)
            .initial("V", V0)
            .build()
    }

    /// Full IFN + virus model (coupled scenario reference)
    pub fn ifn_model() -> Result<ReactionNetwork> {
        full_model(IFN_MODEL, "k21*IFN", T4_COUPLED, 0.0)
    }

    /// Full model with P-dependent IFNe production (lumped scenario reference)
    pub fn lumped_model() -> Result<ReactionNetwork> {
        full_model(LUMPED_MODEL, "P*k21*IFN", T4_LUMPED, IRF7_LUMPED)
    }

    /// Viral replication only; `IFN` is an input
    pub fn viral_model() -> Result<ReactionNetwork> {
        NetworkBuilder::new(VIRAL_MODEL)
            .reaction("E7a", &["P"], &[], "P*k61*V")
            .reaction("E8a", &[], &["V"], "P*k71*V/(1.0+k72*IFN*7E-5)")
            .reaction("E8b", &["V"], &[], "k73*V")
            .parameters(&subset(&["k61", "k71", "k72", "k73"]))
            .initial("P", 1.0)
            .initial("V", V0)
            .initial("IFN", 0.0)
            .build()
    }

    /// IFN signaling only; `P`, `V` and `IFNe` are inputs
    ///
    /// Secreted IFN leaves the cell (E2b has no product); the field
    /// coupling accounts for it.
    pub fn ifn_submodel() -> Result<ReactionNetwork> {
        NetworkBuilder::new(IFN_SUBMODEL)
            .reaction("E2a", &[], &["IFN"], "P*(k12*(V^n)/(k13+(V^n))+k14*IRF7P)")
            .reaction("E2b", &["IFN"], &[], "k21*IFN")
            .reaction("E4a", &[], &["STATP"], "P*k31*IFNe/(k32+k33*IFNe)")
            .reaction("E4b", &["STATP"], &[], "t3*STATP")
            .reaction("E5a", &[], &["IRF7"], "P*(k41*STATP+k42*IRF7P)")
            .reaction("E5b", &["IRF7"], &[], "t4*IRF7")
            .reaction("E6a", &[], &["IRF7P"], "P*k51*IRF7")
            .reaction("E6b", &["IRF7P"], &[], "t5*IRF7P")
            .parameters(&subset(&[
                "k12", "k13", "k14", "k21", "t2", "k31", "k32", "k33", "t3", "k41", "k42", "k51",
                "t5", "n",
            ]))
            .parameter("t4", T4_COUPLED)
            .initial("P", 0.0)
            .initial("V", 0.0)
            .initial("IFNe", 0.0)
            .build()
    }

    /// IRF7 production/decay driven by `STATP` and `IRF7P` inputs
    pub fn irf7_submodel() -> Result<ReactionNetwork> {
        NetworkBuilder::new(IRF7_SUBMODEL)
            .reaction("E5a", &[], &["IRF7"], "k41*STATP+k42*IRF7P")
            .reaction("E5b", &["IRF7"], &[], "t4*IRF7")
            .parameters(&subset(&["k41", "k42"]))
            .parameter("t4", T4_LUMPED)
            .initial("STATP", 0.0)
            .initial("IRF7P", 0.0)
            .initial("IRF7", IRF7_LUMPED)
            .build()
    }

    /// Look up a built-in network by name
    pub fn by_name(name: &str) -> Result<ReactionNetwork> {
        match name {
            IFN_MODEL => ifn_model(),
            VIRAL_MODEL => viral_model(),
            IFN_SUBMODEL => ifn_submodel(),
            LUMPED_MODEL => lumped_model(),
            IRF7_SUBMODEL => irf7_submodel(),
            other => Err(VirosigError::NetworkNotFound(other.to_string())),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(expr: &Expr<String>) -> Expr<Slot> {
        let names = ["a", "b", "c"];
        expr.resolve(&mut |v: &String| {
            let i = names.iter().position(|n| n == v).unwrap();
            Ok(Slot::Species(i))
        })
        .unwrap()
    }

    #[test]
    fn test_parse_precedence() {
        let y = [2.0, 3.0, 4.0];
        let e = slots(&Expr::parse("a+b*c").unwrap());
        assert_eq!(e.eval(&y, &[]), 14.0);

        let e = slots(&Expr::parse("(a+b)*c").unwrap());
        assert_eq!(e.eval(&y, &[]), 20.0);

        // right-associative power, binds tighter than unary minus
        let e = slots(&Expr::parse("a^b^2").unwrap());
        assert_eq!(e.eval(&y, &[]), 512.0);
        let e = slots(&Expr::parse("-a^2").unwrap());
        assert_eq!(e.eval(&y, &[]), -4.0);

        let e = slots(&Expr::parse("c - -a / b").unwrap());
        assert!((e.eval(&y, &[]) - (4.0 + 2.0 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn test_parse_literals() {
        let e = Expr::parse("1.0+k72*IFN*7E-5").unwrap();
        let vars: Vec<&String> = e.variables();
        assert_eq!(vars, vec!["k72", "IFN"]);

        let e = Expr::parse(".5e+1").unwrap();
        assert_eq!(e, Expr::Const(5.0));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("k1*").is_err());
        assert!(Expr::parse("(a+b").is_err());
        assert!(Expr::parse("a $ b").is_err());
    }

    #[test]
    fn test_builder_rejects_unknown_identifier() {
        let result = NetworkBuilder::new("bad")
            .reaction("r1", &["A"], &[], "k*A*B")
            .parameter("k", 1.0)
            .build();
        assert!(matches!(result, Err(VirosigError::ParseError(_))));
    }

    #[test]
    fn test_builder_rejects_duplicates() {
        let result = NetworkBuilder::new("dup")
            .reaction("r1", &["A"], &[], "k*A")
            .parameter("k", 1.0)
            .parameter("A", 2.0)
            .build();
        assert!(result.is_err());

        let result = NetworkBuilder::new("dup")
            .reaction("r1", &["A"], &[], "k*A")
            .reaction("r1", &[], &["A"], "k")
            .parameter("k", 1.0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_stoichiometry_matrix() {
        let net = models::ifn_model().unwrap();
        let stoich = net.stoichiometry_matrix();
        assert_eq!(stoich.nrows(), 8); // IFN, IFNe, STATP, IRF7, IRF7P, P, V, RIGI
        assert_eq!(stoich.ncols(), 12);

        let ifn = net.species_index("IFN").unwrap();
        let ifne = net.species_index("IFNe").unwrap();
        assert_eq!(stoich[[ifn, 1]], -1.0);
        assert_eq!(stoich[[ifne, 1]], 1.0);

        let with_coeff = NetworkBuilder::new("dimer")
            .reaction("bind", &["2 A"], &["B"], "k*A^2")
            .parameter("k", 0.1)
            .initial("A", 1.0)
            .build()
            .unwrap();
        assert_eq!(with_coeff.stoichiometry_matrix()[[0, 0]], -2.0);
    }

    #[test]
    fn test_inputs() {
        assert_eq!(models::viral_model().unwrap().inputs(), vec!["IFN"]);
        let submodel = models::ifn_submodel().unwrap();
        let mut inputs = submodel.inputs();
        inputs.sort();
        assert_eq!(inputs, vec!["IFNe", "P", "V"]);
        assert_eq!(models::ifn_model().unwrap().inputs(), vec!["RIGI"]);
    }

    #[test]
    fn test_mass_action_decay() {
        let net = NetworkBuilder::new("decay")
            .reaction("r1", &["A"], &["B"], "k*A")
            .parameter("k", 0.5)
            .initial("A", 2.0)
            .build()
            .unwrap();
        let mut instance = ModelInstance::new(Arc::new(net));
        let integrator = FixedStepIntegrator::new(IntegratorConfig {
            method: IntegrationMethod::Rk4,
            substeps: 10,
        });
        instance.advance(&integrator, 1.0).unwrap();

        let expected = 2.0 * (-0.5f64).exp();
        assert!((instance.get("A").unwrap() - expected).abs() < 1e-6);
        // mass conserved between A and B
        let total = instance.get("A").unwrap() + instance.get("B").unwrap();
        assert!((total - 2.0).abs() < 1e-12);
        assert!((instance.time() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_methods_converge() {
        let net = Arc::new(
            NetworkBuilder::new("decay")
                .reaction("r1", &["A"], &[], "A")
                .initial("A", 1.0)
                .build()
                .unwrap(),
        );
        let expected = (-1.0f64).exp();
        for (method, tol) in [
            (IntegrationMethod::Euler, 5e-3),
            (IntegrationMethod::Heun, 5e-5),
            (IntegrationMethod::Rk4, 1e-9),
        ] {
            let mut instance = ModelInstance::new(net.clone());
            let integrator = FixedStepIntegrator::new(IntegratorConfig { method, substeps: 100 });
            instance.advance(&integrator, 1.0).unwrap();
            let err = (instance.get("A").unwrap() - expected).abs();
            assert!(err < tol, "{:?} error {}", method, err);
        }
    }

    #[test]
    fn test_virus_grows_in_first_step() {
        let mut instance = ModelInstance::new(Arc::new(models::ifn_model().unwrap()));
        assert_eq!(instance.get("P").unwrap(), 1.0);
        assert_eq!(instance.get("RIGI").unwrap(), 1.0);
        assert_eq!(instance.get("IRF7").unwrap(), 0.0);
        assert_eq!(instance.get("IFN").unwrap(), 0.0);

        let v0 = instance.get("V").unwrap();
        instance
            .advance(&FixedStepIntegrator::default(), 1.0 / 6.0)
            .unwrap();
        assert!(instance.get("V").unwrap() > v0);
        assert!(instance.get("IFN").unwrap() > 0.0);
    }

    #[test]
    fn test_instance_get_set() {
        let mut instance = ModelInstance::new(Arc::new(models::viral_model().unwrap()));
        instance.set("IFN", 2.5).unwrap();
        assert_eq!(instance.get("IFN").unwrap(), 2.5);

        instance.scale("k71", 2.0).unwrap();
        assert!((instance.get("k71").unwrap() - 3.074).abs() < 1e-12);
        // template untouched
        assert_eq!(instance.network().parameter("k71"), Some(1.537));

        assert!(matches!(
            instance.get("STATP"),
            Err(VirosigError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn test_non_finite_detected() {
        let net = NetworkBuilder::new("blowup")
            .reaction("r1", &[], &["A"], "k*A^2")
            .parameter("k", 1.0)
            .initial("A", 1e200)
            .build()
            .unwrap();
        let mut instance = ModelInstance::new(Arc::new(net));
        let err = instance
            .advance(&FixedStepIntegrator::default(), 1.0)
            .unwrap_err();
        assert!(matches!(err, VirosigError::NonFinite { ref variable, .. } if variable == "A"));
    }

    #[test]
    fn test_time_course() {
        let mut instance = ModelInstance::new(Arc::new(models::lumped_model().unwrap()));
        let result = time_course(&mut instance, &FixedStepIntegrator::default(), 1.0 / 3.0, 9).unwrap();
        assert_eq!(result.time.len(), 10);
        assert_eq!(result.concentrations["V"].len(), 10);
        assert!((result.time[9] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_by_name() {
        for name in models::ALL {
            assert_eq!(models::by_name(name).unwrap().name(), name);
        }
        assert!(matches!(
            models::by_name("nope"),
            Err(VirosigError::NetworkNotFound(_))
        ));
    }
}
