use absint::analysis::cfg::Direction;
use absint::analysis::fixpoint::{ConcurrentIterator, WorklistIterator, WtoIterator};
use absint::analysis::ordering::{Wpo, WpoKind, WtoComponent};
use absint::{
    AbstractDomain, AbstractStateMap, BlockCfg, BoxError, Checker, ControlFlowGraph,
    FixpointIterator, IteratorPolicy, Termination,
};
use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use itertools::Itertools;
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use tracing_subscriber::EnvFilter;

const APP_NAME: &str = "absint";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AbsintConfig {
    pub policy: IteratorPolicy,
    /// Worker threads for the concurrent strategy; 0 uses rayon's global pool.
    pub workers: usize,
}

impl AbsintConfig {
    fn merged(mut self, params: &AbsintParams) -> Self {
        if let Some(joins) = params.max_join_iterations {
            self.policy.max_join_iterations = joins;
        }
        if let Some(widenings) = params.max_widen_iterations {
            self.policy.max_widen_iterations = widenings;
        }
        if let Some(workers) = params.workers {
            self.workers = workers;
        }
        self
    }
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct AbsintParams {
    #[command(subcommand)]
    pub command: Commands,
    /// Joins performed at a loop head before switching to widening (stored as default)
    #[arg(long, global = true)]
    pub max_join_iterations: Option<usize>,
    /// Widenings allowed at a loop head before giving up (stored as default)
    #[arg(long, global = true)]
    pub max_widen_iterations: Option<usize>,
    /// Worker threads for the concurrent strategy (stored as default)
    #[arg(long, global = true)]
    pub workers: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Prints the weak topological and weak partial ordering of a graph
    Order {
        #[command(flatten)]
        graph: GraphArgs,
    },
    /// Computes bounds on the number of blocks executed before reaching each block
    Analyze {
        #[arg(long, value_enum, default_value_t = Strategy::Wto)]
        strategy: Strategy,
        /// Stop as soon as a block is only reachable through more than this many blocks
        #[arg(long)]
        limit: Option<u64>,
        #[command(flatten)]
        graph: GraphArgs,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Strategy {
    Wto,
    Worklist,
    Concurrent,
}

#[derive(Debug, Args)]
struct GraphArgs {
    #[arg(long)]
    pub entry: String,
    #[arg(long)]
    pub exit: Option<String>,
    /// Propagate from the exit towards the entry
    #[arg(long, requires = "exit")]
    pub backward: bool,
    /// Edges written as `from-to`
    #[arg(required = true, value_parser = parse_edge)]
    pub edges: Vec<(String, String)>,
}

impl GraphArgs {
    fn build(&self) -> BlockCfg<String> {
        let mut cfg = BlockCfg::new(self.entry.clone());
        for (from, to) in &self.edges {
            cfg.add_edge(from.clone(), to.clone());
        }
        if let Some(exit) = &self.exit {
            cfg.set_exit(exit.clone());
        }
        cfg
    }

    fn direction(&self) -> Direction {
        if self.backward {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }
}

fn parse_edge(s: &str) -> Result<(String, String), String> {
    match s.split_once('-') {
        Some((from, to)) if !from.is_empty() && !to.is_empty() => {
            Ok((from.to_string(), to.to_string()))
        }
        _ => Err(format!("expected an edge like `a-b`, got `{s}`")),
    }
}

/// Lower and upper bound on a path length; `max == None` is unbounded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Steps {
    min: u64,
    max: Option<u64>,
}

impl Steps {
    fn step(&self) -> Self {
        Self {
            min: self.min.saturating_add(1),
            max: self.max.map(|m| m.saturating_add(1)),
        }
    }
}

impl Display for Steps {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.max {
            Some(max) => write!(f, "[{}, {max}]", self.min),
            None => write!(f, "[{}, +inf]", self.min),
        }
    }
}

impl AbstractDomain for Steps {
    fn join_with(&mut self, other: &Self) {
        self.min = self.min.min(other.min);
        self.max = self.max.zip(other.max).map(|(a, b)| a.max(b));
    }

    fn widen_with(&mut self, other: &Self) {
        if other.min < self.min {
            self.min = 0;
        }
        let grows = match (self.max, other.max) {
            (Some(a), Some(b)) => b > a,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if grows {
            self.max = None;
        }
    }

    fn leq(&self, other: &Self) -> bool {
        let below = match (self.max, other.max) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => a <= b,
        };
        self.min >= other.min && below
    }
}

struct PathLimit(u64);

impl Checker<NodeIndex, Steps> for PathLimit {
    fn name(&self) -> &str {
        "path-limit"
    }

    fn check(&self, node: NodeIndex, states: &AbstractStateMap<NodeIndex, Steps>) -> Result<(), String> {
        match states.get_post(node) {
            Some(steps) if steps.min > self.0 => Err(format!(
                "every path takes at least {} blocks (limit {})",
                steps.min, self.0
            )),
            _ => Ok(()),
        }
    }
}

fn step(_: NodeIndex, pre: &Steps) -> Result<Steps, BoxError> {
    Ok(pre.step())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let params: AbsintParams = AbsintParams::parse();
    let config = update_config(&params)?;
    match &params.command {
        Commands::Order { graph } => order(graph),
        Commands::Analyze {
            strategy,
            limit,
            graph,
        } => analyze(&config, *strategy, *limit, graph),
    }
}

fn update_config(params: &AbsintParams) -> anyhow::Result<AbsintConfig> {
    let stored_config: AbsintConfig =
        confy::load(APP_NAME, None).context("Could not load the stored configuration")?;
    let new_config = stored_config.clone().merged(params);
    if stored_config != new_config {
        confy::store(APP_NAME, None, &new_config).context("Could not store the configuration")?;
    }
    Ok(new_config)
}

fn order(args: &GraphArgs) -> anyhow::Result<()> {
    let cfg = args.build();
    let wpo = Wpo::new(&cfg, args.direction())?;
    println!("WTO: {}", render(&cfg, wpo.wto().components()));
    println!("WPO:");
    for (pos, node) in wpo.iter() {
        let name = wpo.node(pos).map_or("?", |n| block_name(&cfg, n));
        let kind = match node.kind() {
            WpoKind::Plain(_) => "",
            WpoKind::Head { .. } => "head ",
            WpoKind::Exit { .. } => "exit of ",
        };
        print!("  {pos}: {kind}{name} -> [{}]", node.successors().iter().join(", "));
        if !node.irreducible().is_empty() {
            let restores = node
                .irreducible()
                .iter()
                .map(|(p, c)| format!("{p}+{c}"))
                .join(", ");
            print!(" restores [{restores}]");
        }
        println!();
    }
    Ok(())
}

fn block_name(cfg: &BlockCfg<String>, node: NodeIndex) -> &str {
    cfg.block(node).map(String::as_str).unwrap_or("?")
}

fn render(cfg: &BlockCfg<String>, components: &[WtoComponent<NodeIndex>]) -> String {
    components
        .iter()
        .map(|c| match c {
            WtoComponent::Vertex(n) => block_name(cfg, *n).to_string(),
            WtoComponent::Cycle { head, components } if components.is_empty() => {
                format!("({})", block_name(cfg, *head))
            }
            WtoComponent::Cycle { head, components } => {
                format!("({} {})", block_name(cfg, *head), render(cfg, components))
            }
        })
        .join(" ")
}

fn analyze(
    config: &AbsintConfig,
    strategy: Strategy,
    limit: Option<u64>,
    args: &GraphArgs,
) -> anyhow::Result<()> {
    let cfg = args.build();
    let direction = args.direction();
    let policy = config.policy;
    let initial = Steps {
        min: 0,
        max: Some(0),
    };
    let (states, termination) = match strategy {
        Strategy::Wto => {
            let mut iter = WtoIterator::new(&cfg, direction, policy, step, initial)?;
            if let Some(limit) = limit {
                iter = iter.with_checker(PathLimit(limit));
            }
            let termination = iter.iterate_until_fixpoint()?.termination;
            (iter.into_states(), termination)
        }
        Strategy::Worklist => {
            let mut iter = WorklistIterator::new(&cfg, direction, policy, step, initial)?;
            if let Some(limit) = limit {
                iter = iter.with_checker(PathLimit(limit));
            }
            let termination = iter.iterate_until_fixpoint()?.termination;
            (iter.into_states(), termination)
        }
        Strategy::Concurrent => {
            if limit.is_some() {
                bail!("--limit is not supported by the concurrent strategy");
            }
            let mut iter = ConcurrentIterator::new(&cfg, direction, policy, step, initial)?;
            if config.workers > 0 {
                iter = iter.with_workers(config.workers)?;
            }
            let termination = iter.iterate_until_fixpoint()?.termination;
            (iter.into_states(), termination)
        }
    };
    for node in cfg.nodes() {
        let Some(block) = cfg.block(node) else {
            continue;
        };
        match (states.get_pre(node), states.get_post(node)) {
            (Some(pre), Some(post)) => println!("{block}: {pre} -> {post}"),
            (Some(pre), None) => println!("{block}: {pre} -> ?"),
            _ => println!("{block}: unreachable"),
        }
    }
    match termination {
        Termination::Converged => Ok(()),
        Termination::Checker(violation) => {
            bail!(
                "stopped at {}: {}",
                block_name(&cfg, violation.node),
                violation.message
            )
        }
        Termination::Aborted(err) => Err(err.into()),
    }
}
