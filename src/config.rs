use clap::Parser;

/// Football jackpot probability engine
#[derive(Parser, Debug, Clone)]
#[command(name = "jackpot-engine", version, about)]
pub struct Config {
    /// API listen address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8090")]
    pub listen_addr: String,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "jackpot.db")]
    pub database_path: String,

    /// Per-request compute budget in milliseconds
    #[arg(long, env = "REQUEST_BUDGET_MS", default_value = "10000")]
    pub request_budget_ms: u64,

    /// Time-decay rate per day for match weighting (half-life ~107 days at
    /// the default)
    #[arg(long, env = "MODEL_XI", default_value = "0.0065")]
    pub xi: f64,

    /// Training window in years
    #[arg(long, env = "MODEL_LOOKBACK_YEARS", default_value = "5.0")]
    pub lookback_years: f64,

    /// Fallback low-score correlation when no fitted value exists
    #[arg(long, env = "MODEL_RHO", default_value = "-0.10")]
    pub rho: f64,

    /// EV acceptance threshold before any learned value is published
    #[arg(long, env = "EV_THRESHOLD", default_value = "0.0")]
    pub ev_threshold: f64,

    /// Maximum hard contradictions tolerated per ticket
    #[arg(long, env = "MAX_CONTRADICTIONS", default_value = "0")]
    pub max_contradictions: i64,

    /// Correlation penalty weight in the portfolio objective
    #[arg(long, env = "PORTFOLIO_LAMBDA", default_value = "0.5")]
    pub portfolio_lambda: f64,

    /// Maximum tickets in a returned bundle
    #[arg(long, env = "MAX_BUNDLE_SIZE", default_value = "5")]
    pub max_bundle_size: usize,

    /// Lower clamp of the adjusted draw probability
    #[arg(long, env = "DRAW_FLOOR", default_value = "0.12")]
    pub draw_floor: f64,

    /// Upper clamp of the adjusted draw probability
    #[arg(long, env = "DRAW_CEILING", default_value = "0.38")]
    pub draw_ceiling: f64,

    /// Lower clamp of the draw-structural multiplier
    #[arg(long, env = "MULTIPLIER_FLOOR", default_value = "0.75")]
    pub multiplier_floor: f64,

    /// Upper clamp of the draw-structural multiplier
    #[arg(long, env = "MULTIPLIER_CEILING", default_value = "1.35")]
    pub multiplier_ceiling: f64,

    /// How often to refit team strengths
    #[arg(long, env = "TRAINING_INTERVAL_SECS", default_value = "21600")]
    pub training_interval_secs: u64,

    /// How often to refit calibration from settled snapshots
    #[arg(long, env = "CALIBRATION_INTERVAL_SECS", default_value = "3600")]
    pub calibration_interval_secs: u64,

    /// How often to re-learn the EV acceptance threshold
    #[arg(long, env = "THRESHOLD_INTERVAL_SECS", default_value = "7200")]
    pub threshold_interval_secs: u64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.request_budget_ms == 0 || self.request_budget_ms > 300_000 {
            anyhow::bail!("request_budget_ms must be between 1 and 300000");
        }
        if !(0.0..=0.1).contains(&self.xi) {
            anyhow::bail!("xi must be between 0.0 and 0.1");
        }
        if !(0.5..=20.0).contains(&self.lookback_years) {
            anyhow::bail!("lookback_years must be between 0.5 and 20");
        }
        if !(-0.35..=0.35).contains(&self.rho) {
            anyhow::bail!("rho must be between -0.35 and 0.35");
        }
        if self.max_contradictions < 0 {
            anyhow::bail!("max_contradictions must be non-negative");
        }
        if !(0.0..=10.0).contains(&self.portfolio_lambda) {
            anyhow::bail!("portfolio_lambda must be between 0.0 and 10.0");
        }
        if self.max_bundle_size == 0 || self.max_bundle_size > 50 {
            anyhow::bail!("max_bundle_size must be between 1 and 50");
        }
        if !(0.0..0.5).contains(&self.draw_floor)
            || !(self.draw_floor..=0.6).contains(&self.draw_ceiling)
        {
            anyhow::bail!("draw bounds must satisfy 0 <= floor < ceiling <= 0.6");
        }
        if self.multiplier_floor <= 0.0 || self.multiplier_floor >= self.multiplier_ceiling {
            anyhow::bail!("multiplier bounds must satisfy 0 < floor < ceiling");
        }
        if self.training_interval_secs == 0 || self.training_interval_secs > 7 * 24 * 60 * 60 {
            anyhow::bail!("training_interval_secs must be between 1 and 604800");
        }
        if self.calibration_interval_secs == 0
            || self.calibration_interval_secs > 7 * 24 * 60 * 60
        {
            anyhow::bail!("calibration_interval_secs must be between 1 and 604800");
        }
        if self.threshold_interval_secs == 0 || self.threshold_interval_secs > 7 * 24 * 60 * 60 {
            anyhow::bail!("threshold_interval_secs must be between 1 and 604800");
        }
        Ok(())
    }

    /// Resolve the per-request pipeline configuration. The EV threshold is
    /// the learned one when available.
    pub fn pipeline_config(&self, learned_threshold: Option<f64>) -> crate::pipeline::PipelineConfig {
        crate::pipeline::PipelineConfig {
            xi: self.xi,
            rho: self.rho,
            lookback_years: self.lookback_years,
            ev_threshold: learned_threshold.unwrap_or(self.ev_threshold),
            max_contradictions: self.max_contradictions,
            portfolio_lambda: self.portfolio_lambda,
            draw_bounds: (self.draw_floor, self.draw_ceiling),
            multiplier_bounds: (self.multiplier_floor, self.multiplier_ceiling),
            max_bundle_size: self.max_bundle_size,
        }
    }
}
