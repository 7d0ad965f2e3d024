use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::{Parser, ValueEnum};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;

use crate::core::{
    AnchorRow, AnchorStore, DEFAULT_BONUS_DIVISOR, DEFAULT_DIVERGENCE_THRESHOLD, DEFAULT_EXPENSES,
    DEFAULT_MAX_INCOME, DEFAULT_MAX_SWEEPS, DEFAULT_POLICY_FRACTIONS, DEFAULT_TIME_DISCOUNT,
    DEFAULT_TOLERANCE, HISTORICAL_RETURNS, Model, ModelParams, Refinement, ReturnDistribution,
    RunReport, Snapshot, Solver, SolverConfig, State, SweepMode, default_max_value, seed,
};

// HTTP request ceilings; the CLI is not limited.
const API_MAX_SWEEPS: u32 = 5_000;
const API_MAX_ANCHORS: usize = 250_000;
const API_MAX_POLICY_FRACTIONS: usize = 1_000;
const API_MAX_INCOME_BREAKPOINTS: usize = 1_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliStore {
    Spatial,
    Lattice,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliRefinement {
    All,
    Random,
}

impl From<CliRefinement> for Refinement {
    fn from(value: CliRefinement) -> Self {
        match value {
            CliRefinement::All => Refinement::AllDependencies,
            CliRefinement::Random => Refinement::RandomDependency,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiStore {
    Spatial,
    Lattice,
}

impl From<ApiStore> for CliStore {
    fn from(value: ApiStore) -> Self {
        match value {
            ApiStore::Spatial => CliStore::Spatial,
            ApiStore::Lattice => CliStore::Lattice,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiRefinement {
    #[serde(alias = "all-dependencies", alias = "allDependencies")]
    All,
    #[serde(alias = "random-dependency", alias = "randomDependency")]
    Random,
}

impl From<ApiRefinement> for CliRefinement {
    fn from(value: ApiRefinement) -> Self {
        match value {
            ApiRefinement::All => CliRefinement::All,
            ApiRefinement::Random => CliRefinement::Random,
        }
    }
}

/// A JSON array, or a comma-separated string as sent in a GET query.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReturnsField {
    List(Vec<f64>),
    Csv(String),
}

impl ReturnsField {
    fn into_vec(self) -> Result<Vec<f64>, String> {
        match self {
            ReturnsField::List(v) => Ok(v),
            ReturnsField::Csv(text) => text
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<f64>()
                        .map_err(|_| format!("returns: '{s}' is not a number"))
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SolvePayload {
    time_discount: Option<f64>,
    expenses: Option<f64>,
    max_value: Option<f64>,
    max_net_worth: Option<f64>,
    max_income: Option<f64>,
    returns: Option<ReturnsField>,
    policy_fractions: Option<usize>,
    bonus_divisor: Option<f64>,

    store: Option<ApiStore>,
    net_worth_step: Option<f64>,
    income_step: Option<f64>,
    income_breakpoints: Option<usize>,

    tolerance: Option<f64>,
    divergence_threshold: Option<f64>,
    max_sweeps: Option<u32>,
    warmup_sweeps: Option<u32>,
    refine: Option<bool>,
    refinement: Option<ApiRefinement>,
    refine_min_income: Option<f64>,
    jitter: Option<bool>,
    seed: Option<u64>,
}

#[derive(Parser, Debug)]
#[command(
    name = "fire-policy",
    about = "Value-iteration solver for savings policy over (net worth, income)"
)]
pub struct Cli {
    #[arg(
        long,
        default_value_t = DEFAULT_TIME_DISCOUNT,
        help = "Per-year discount on continuation value, survival included"
    )]
    time_discount: f64,
    #[arg(long, default_value_t = DEFAULT_EXPENSES)]
    expenses: f64,
    #[arg(long, help = "Value bound; defaults to 1.1 / (1 - time_discount)")]
    max_value: Option<f64>,
    #[arg(long, help = "Upper net worth bound; defaults to 100 years of expenses")]
    max_net_worth: Option<f64>,
    #[arg(long, default_value_t = DEFAULT_MAX_INCOME)]
    max_income: f64,
    #[arg(
        long,
        value_delimiter = ',',
        help = "Yearly return multipliers; defaults to the historical Wilshire 5000 series"
    )]
    returns: Vec<f64>,
    #[arg(long, default_value_t = DEFAULT_POLICY_FRACTIONS)]
    policy_fractions: usize,
    #[arg(long, default_value_t = DEFAULT_BONUS_DIVISOR)]
    bonus_divisor: f64,

    #[arg(long, value_enum, default_value_t = CliStore::Spatial)]
    store: CliStore,
    #[arg(long, help = "Net worth spacing of the seed anchors; defaults to max_net_worth / 40")]
    net_worth_step: Option<f64>,
    #[arg(long, help = "Income spacing of a lattice store; defaults to max_income / 10")]
    income_step: Option<f64>,
    #[arg(
        long,
        default_value_t = 10,
        help = "Log-spaced income rows of a spatial seed, centred on expenses"
    )]
    income_breakpoints: usize,

    #[arg(long, default_value_t = DEFAULT_TOLERANCE)]
    tolerance: f64,
    #[arg(long, default_value_t = DEFAULT_DIVERGENCE_THRESHOLD)]
    divergence_threshold: f64,
    #[arg(long, default_value_t = DEFAULT_MAX_SWEEPS)]
    max_sweeps: u32,
    #[arg(long, default_value_t = 0)]
    warmup_sweeps: u32,
    #[arg(long, help = "Insert anchors where the backup error is largest")]
    refine: bool,
    #[arg(long, value_enum, default_value_t = CliRefinement::All)]
    refinement: CliRefinement,
    #[arg(
        long,
        help = "Refinement ignores anchors at or below this income; defaults to expenses / 10"
    )]
    refine_min_income: Option<f64>,
    #[arg(long, help = "Shift policy fractions by a random draw every sweep")]
    jitter: bool,
    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, help = "Start from a saved snapshot instead of a random seed")]
    resume: Option<PathBuf>,
    #[arg(long, help = "Write the final anchors to this snapshot file")]
    save: Option<PathBuf>,
    #[arg(long, help = "Also write debug-level logs to this file")]
    log_file: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum StoreLayout {
    Spatial {
        net_worth_step: f64,
        income_breakpoints: usize,
    },
    Lattice {
        spacing: State,
    },
}

impl StoreLayout {
    fn seed_anchors(&self, max: State) -> f64 {
        match *self {
            StoreLayout::Spatial {
                net_worth_step,
                income_breakpoints,
            } => (max.x / net_worth_step + 2.0) * (income_breakpoints as f64 + 2.0),
            StoreLayout::Lattice { spacing } => {
                (max.x / spacing.x + 2.0) * (max.y / spacing.y + 2.0)
            }
        }
    }
}

#[derive(Debug)]
struct SolveRequest {
    model: Model,
    config: SolverConfig,
    mode: SweepMode,
    layout: StoreLayout,
    resume: Option<PathBuf>,
    save: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SolveResponse {
    store: &'static str,
    mode: SweepMode,
    refinement: Refinement,
    report: RunReport,
    anchors: Vec<AnchorRow>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReturnsResponse {
    source: &'static str,
    mean: f64,
    multipliers: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn build_request(cli: Cli) -> Result<SolveRequest, String> {
    if !(cli.time_discount > 0.0 && cli.time_discount < 1.0) {
        return Err("--time-discount must be between 0 and 1 (exclusive)".to_string());
    }
    if !(cli.expenses > 0.0 && cli.expenses.is_finite()) {
        return Err("--expenses must be > 0".to_string());
    }
    if !(cli.max_income > 0.0 && cli.max_income.is_finite()) {
        return Err("--max-income must be > 0".to_string());
    }
    if cli.policy_fractions == 0 {
        return Err("--policy-fractions must be > 0".to_string());
    }
    if cli.max_sweeps == 0 {
        return Err("--max-sweeps must be > 0".to_string());
    }
    if !(cli.tolerance > 0.0) {
        return Err("--tolerance must be > 0".to_string());
    }
    if !(cli.divergence_threshold > cli.tolerance) {
        return Err("--divergence-threshold must be greater than --tolerance".to_string());
    }

    let max_net_worth = cli.max_net_worth.unwrap_or(100.0 * cli.expenses);
    if !(max_net_worth > 0.0 && max_net_worth.is_finite()) {
        return Err("--max-net-worth must be > 0".to_string());
    }
    let max_value = cli
        .max_value
        .unwrap_or_else(|| default_max_value(cli.time_discount));
    let returns = if cli.returns.is_empty() {
        ReturnDistribution::historical()
    } else {
        ReturnDistribution::new(cli.returns).map_err(|e| format!("--returns: {e}"))?
    };

    let model = Model::new(ModelParams {
        time_discount: cli.time_discount,
        expenses: cli.expenses,
        max_value,
        returns,
        min_state: State::ORIGIN,
        max_state: State::new(max_net_worth, cli.max_income),
        policy_fractions: cli.policy_fractions,
        bonus_divisor: cli.bonus_divisor,
    })
    .map_err(|e| e.to_string())?;

    let net_worth_step = cli.net_worth_step.unwrap_or(max_net_worth / 40.0);
    if !(net_worth_step > 0.0 && net_worth_step.is_finite()) {
        return Err("--net-worth-step must be > 0".to_string());
    }
    let layout = match cli.store {
        CliStore::Spatial => StoreLayout::Spatial {
            net_worth_step,
            income_breakpoints: cli.income_breakpoints,
        },
        CliStore::Lattice => {
            let income_step = cli.income_step.unwrap_or(cli.max_income / 10.0);
            if !(income_step > 0.0 && income_step.is_finite()) {
                return Err("--income-step must be > 0".to_string());
            }
            StoreLayout::Lattice {
                spacing: State::new(net_worth_step, income_step),
            }
        }
    };

    let mut config = SolverConfig::for_model(&model);
    config.tolerance = cli.tolerance;
    config.divergence_threshold = cli.divergence_threshold;
    config.max_sweeps = cli.max_sweeps;
    config.warmup_sweeps = cli.warmup_sweeps;
    config.refinement = cli.refinement.into();
    config.jitter = cli.jitter;
    config.seed = cli.seed;
    if let Some(v) = cli.refine_min_income {
        config.refine_min_income = v;
    }

    Ok(SolveRequest {
        model,
        config,
        mode: if cli.refine {
            SweepMode::Refine
        } else {
            SweepMode::Plain
        },
        layout,
        resume: cli.resume,
        save: cli.save,
    })
}

fn run_solve(request: &SolveRequest) -> Result<SolveResponse, String> {
    let mut rng = SmallRng::seed_from_u64(request.config.seed);
    let resumed = match &request.resume {
        Some(path) => {
            let snapshot = Snapshot::load(path).map_err(|e| e.to_string())?;
            if !snapshot.matches(&request.model) {
                log::warn!(
                    "snapshot {} was taken under different bounds; values are reused as-is",
                    path.display()
                );
            }
            Some(snapshot)
        }
        None => None,
    };

    match request.layout {
        StoreLayout::Spatial {
            net_worth_step,
            income_breakpoints,
        } => {
            let store = match resumed {
                Some(snapshot) => snapshot.into_spatial(),
                None => seed::log_income_spatial(
                    &request.model,
                    net_worth_step,
                    income_breakpoints,
                    &mut rng,
                )
                .map_err(|e| e.to_string())?,
            };
            solve_store(request, store, "spatial")
        }
        StoreLayout::Lattice { spacing } => {
            let store = match resumed {
                Some(snapshot) => snapshot
                    .into_lattice(Some(spacing))
                    .map_err(|e| e.to_string())?,
                None => seed::random_lattice(&request.model, spacing, &mut rng)
                    .map_err(|e| e.to_string())?,
            };
            solve_store(request, store, "lattice")
        }
    }
}

fn solve_store<S: AnchorStore>(
    request: &SolveRequest,
    store: S,
    kind: &'static str,
) -> Result<SolveResponse, String> {
    let mut solver =
        Solver::new(request.model.clone(), store, request.config).map_err(|e| e.to_string())?;
    let report = solver.run(request.mode).map_err(|e| e.to_string())?;

    let snapshot = Snapshot::capture(solver.model(), solver.store());
    if let Some(path) = &request.save {
        snapshot.save(path).map_err(|e| e.to_string())?;
    }

    Ok(SolveResponse {
        store: kind,
        mode: request.mode,
        refinement: request.config.refinement,
        report,
        anchors: snapshot.anchors,
    })
}

pub fn run_cli(cli: Cli) -> Result<(), String> {
    init_logging(cli.log_file.as_deref())?;
    let request = build_request(cli)?;
    let response = run_solve(&request)?;
    let json = serde_json::to_string_pretty(&response).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}

pub fn init_logging(log_file: Option<&Path>) -> Result<(), String> {
    let config = simplelog::ConfigBuilder::new()
        .set_location_level(log::LevelFilter::Off)
        .set_target_level(log::LevelFilter::Off)
        .set_thread_level(log::LevelFilter::Off)
        .build();
    let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> = vec![simplelog::TermLogger::new(
        log::LevelFilter::Info,
        config.clone(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )];
    if let Some(path) = log_file {
        let file = std::fs::File::create(path)
            .map_err(|e| format!("cannot create log file {}: {e}", path.display()))?;
        loggers.push(simplelog::WriteLogger::new(
            log::LevelFilter::Debug,
            config,
            file,
        ));
    }
    simplelog::CombinedLogger::init(loggers).map_err(|e| e.to_string())
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/api/solve", get(solve_get_handler).post(solve_post_handler))
        .route("/api/returns", get(returns_handler))
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    log::info!("policy solver HTTP API listening on http://{addr}");
    log::info!("local access: http://127.0.0.1:{port}/api/solve");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn returns_handler() -> Response {
    let distribution = ReturnDistribution::historical();
    json_response(
        StatusCode::OK,
        ReturnsResponse {
            source: "Wilshire 5000 Total Market Full Cap index, yearly (FRED)",
            mean: distribution.mean(),
            multipliers: HISTORICAL_RETURNS.to_vec(),
        },
    )
}

async fn solve_get_handler(Query(payload): Query<SolvePayload>) -> Response {
    solve_handler_impl(payload).await
}

async fn solve_post_handler(Json(payload): Json<SolvePayload>) -> Response {
    solve_handler_impl(payload).await
}

async fn solve_handler_impl(payload: SolvePayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    match tokio::task::spawn_blocking(move || run_solve(&request)).await {
        Ok(Ok(response)) => json_response(StatusCode::OK, response),
        Ok(Err(msg)) => error_response(StatusCode::UNPROCESSABLE_ENTITY, &msg),
        Err(e) => {
            log::error!("solve task failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Solve task failed")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<SolveRequest, String> {
    let payload = serde_json::from_str::<SolvePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: SolvePayload) -> Result<SolveRequest, String> {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.time_discount {
        cli.time_discount = v;
    }
    if let Some(v) = payload.expenses {
        cli.expenses = v;
    }
    if payload.max_value.is_some() {
        cli.max_value = payload.max_value;
    }
    if payload.max_net_worth.is_some() {
        cli.max_net_worth = payload.max_net_worth;
    }
    if let Some(v) = payload.max_income {
        cli.max_income = v;
    }
    if let Some(field) = payload.returns {
        let v = field.into_vec()?;
        if v.is_empty() {
            return Err("returns must not be empty".to_string());
        }
        cli.returns = v;
    }
    if let Some(v) = payload.policy_fractions {
        if v > API_MAX_POLICY_FRACTIONS {
            return Err(format!("policyFractions must be <= {API_MAX_POLICY_FRACTIONS}"));
        }
        cli.policy_fractions = v;
    }
    if let Some(v) = payload.bonus_divisor {
        cli.bonus_divisor = v;
    }
    if let Some(v) = payload.store {
        cli.store = v.into();
    }
    if payload.net_worth_step.is_some() {
        cli.net_worth_step = payload.net_worth_step;
    }
    if payload.income_step.is_some() {
        cli.income_step = payload.income_step;
    }
    if let Some(v) = payload.income_breakpoints {
        if v > API_MAX_INCOME_BREAKPOINTS {
            return Err(format!(
                "incomeBreakpoints must be <= {API_MAX_INCOME_BREAKPOINTS}"
            ));
        }
        cli.income_breakpoints = v;
    }
    if let Some(v) = payload.tolerance {
        cli.tolerance = v;
    }
    if let Some(v) = payload.divergence_threshold {
        cli.divergence_threshold = v;
    }
    if let Some(v) = payload.max_sweeps {
        if v > API_MAX_SWEEPS {
            return Err(format!("maxSweeps must be <= {API_MAX_SWEEPS}"));
        }
        cli.max_sweeps = v;
    }
    if let Some(v) = payload.warmup_sweeps {
        cli.warmup_sweeps = v;
    }
    if let Some(v) = payload.refine {
        cli.refine = v;
    }
    if let Some(v) = payload.refinement {
        cli.refinement = v.into();
    }
    if payload.refine_min_income.is_some() {
        cli.refine_min_income = payload.refine_min_income;
    }
    if let Some(v) = payload.jitter {
        cli.jitter = v;
    }
    if let Some(v) = payload.seed {
        cli.seed = v;
    }

    let request = build_request(cli)?;
    let anchors = request.layout.seed_anchors(request.model.max_state());
    if !(anchors <= API_MAX_ANCHORS as f64) {
        return Err(format!(
            "seed store would hold about {anchors:.0} anchors, more than {API_MAX_ANCHORS}"
        ));
    }
    Ok(request)
}

fn default_cli_for_api() -> Cli {
    Cli {
        time_discount: DEFAULT_TIME_DISCOUNT,
        expenses: DEFAULT_EXPENSES,
        max_value: None,
        max_net_worth: None,
        max_income: DEFAULT_MAX_INCOME,
        returns: Vec::new(),
        policy_fractions: DEFAULT_POLICY_FRACTIONS,
        bonus_divisor: DEFAULT_BONUS_DIVISOR,
        store: CliStore::Spatial,
        net_worth_step: None,
        income_step: None,
        income_breakpoints: 10,
        tolerance: DEFAULT_TOLERANCE,
        divergence_threshold: DEFAULT_DIVERGENCE_THRESHOLD,
        max_sweeps: 500,
        warmup_sweeps: 0,
        refine: false,
        refinement: CliRefinement::All,
        refine_min_income: None,
        jitter: false,
        seed: 42,
        resume: None,
        save: None,
        log_file: None,
    }
}
