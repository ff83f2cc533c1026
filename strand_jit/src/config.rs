//! JIT tunables.
//!
//! Every option can be set by name, one at a time (`set_param`) or as a
//! comma separated list (`set_params("threshold=3,trace_eagerness=2")`).

use std::fmt;

use strand_core::{JitError, JitResult};

// =============================================================================
// Enabled optimizations
// =============================================================================

/// Subset of the optimizer pipeline to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnableOpts {
    /// Peephole rewriting and constant folding.
    pub rewrite: bool,
    /// Integer bounds.
    pub intbounds: bool,
    /// Escape analysis.
    pub virtualize: bool,
    /// Heap caching.
    pub heap: bool,
    /// Loop peeling.
    pub unroll: bool,
}

impl EnableOpts {
    /// Pass names in pipeline order.
    pub const NAMES: [&'static str; 5] = ["rewrite", "intbounds", "virtualize", "heap", "unroll"];

    /// Every pass.
    pub const fn all() -> Self {
        Self {
            rewrite: true,
            intbounds: true,
            virtualize: true,
            heap: true,
            unroll: true,
        }
    }

    /// No pass at all.
    pub const fn none() -> Self {
        Self {
            rewrite: false,
            intbounds: false,
            virtualize: false,
            heap: false,
            unroll: false,
        }
    }

    /// Parse `all` or a colon separated list of pass names.
    pub fn parse(text: &str) -> JitResult<Self> {
        let text = text.trim();
        if text == "all" {
            return Ok(Self::all());
        }
        let mut opts = Self::none();
        for name in text.split(':').map(str::trim).filter(|n| !n.is_empty()) {
            match name {
                "rewrite" => opts.rewrite = true,
                "intbounds" => opts.intbounds = true,
                "virtualize" => opts.virtualize = true,
                "heap" => opts.heap = true,
                "unroll" => opts.unroll = true,
                other => return Err(JitError::UnknownOptimization(other.to_string())),
            }
        }
        Ok(opts)
    }

    fn flags(&self) -> [bool; 5] {
        [self.rewrite, self.intbounds, self.virtualize, self.heap, self.unroll]
    }
}

impl Default for EnableOpts {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Display for EnableOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::all() {
            return f.write_str("all");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .zip(self.flags())
            .filter_map(|(name, on)| on.then_some(*name))
            .collect();
        f.write_str(&names.join(":"))
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// Tunables of one JIT runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitParams {
    /// Loop iterations before tracing starts.
    pub threshold: i64,
    /// Function entries before tracing starts.
    pub function_threshold: i64,
    /// Guard failures before a bridge is traced.
    pub trace_eagerness: u32,
    /// Maximum number of operations in one trace.
    pub trace_limit: usize,
    /// Inline calls while tracing.
    pub inlining: bool,
    /// Generations a loop survives after its last use.
    pub loop_longevity: u64,
    /// Maximum bridges hanging off one loop.
    pub retrace_limit: u32,
    /// Maximum distinct guards of one loop that may start a bridge.
    pub max_retrace_guards: u32,
    /// Attempts to find a compatible peeled loop.
    pub max_unroll_loops: u32,
    /// Enabled optimizer passes.
    pub enable_opts: EnableOpts,
    /// Maximum inlining depth while tracing.
    pub max_inline_depth: usize,
}

impl Default for JitParams {
    fn default() -> Self {
        Self {
            threshold: 1039,
            function_threshold: 1619,
            trace_eagerness: 200,
            trace_limit: 6000,
            inlining: true,
            loop_longevity: 1000,
            retrace_limit: 5,
            max_retrace_guards: 15,
            max_unroll_loops: 4,
            enable_opts: EnableOpts::all(),
            max_inline_depth: 8,
        }
    }
}

impl JitParams {
    /// Low thresholds so tests reach compiled code quickly.
    pub fn for_testing() -> Self {
        Self {
            threshold: 3,
            function_threshold: 3,
            trace_eagerness: 2,
            ..Self::default()
        }
    }

    /// Parameters with tracing switched off.
    pub fn disabled() -> Self {
        Self {
            threshold: 0,
            function_threshold: 0,
            ..Self::default()
        }
    }

    /// Names accepted by [`JitParams::set_param`].
    pub const NAMES: [&'static str; 11] = [
        "threshold",
        "function_threshold",
        "trace_eagerness",
        "trace_limit",
        "inlining",
        "loop_longevity",
        "retrace_limit",
        "max_retrace_guards",
        "max_unroll_loops",
        "enable_opts",
        "max_inline_depth",
    ];

    /// Set one option from its textual value.
    pub fn set_param(&mut self, name: &str, value: &str) -> JitResult<()> {
        let value = value.trim();
        match name.trim() {
            "threshold" => self.threshold = parse(name, value)?,
            "function_threshold" => self.function_threshold = parse(name, value)?,
            "trace_eagerness" => self.trace_eagerness = parse(name, value)?,
            "trace_limit" => self.trace_limit = parse(name, value)?,
            "inlining" => self.inlining = parse::<u8>(name, value)? != 0,
            "loop_longevity" => self.loop_longevity = parse(name, value)?,
            "retrace_limit" => self.retrace_limit = parse(name, value)?,
            "max_retrace_guards" => self.max_retrace_guards = parse(name, value)?,
            "max_unroll_loops" => self.max_unroll_loops = parse(name, value)?,
            "enable_opts" => self.enable_opts = EnableOpts::parse(value)?,
            "max_inline_depth" => self.max_inline_depth = parse(name, value)?,
            other => return Err(JitError::UnknownParam(other.to_string())),
        }
        Ok(())
    }

    /// Set several options from `name=value` pairs separated by commas.
    ///
    /// Options are applied in order; the first bad entry stops parsing and
    /// leaves the earlier ones applied.
    pub fn set_params(&mut self, text: &str) -> JitResult<()> {
        for entry in text.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, value) = entry.split_once('=').ok_or_else(|| JitError::BadParamValue {
                name: entry.to_string(),
                value: String::new(),
            })?;
            self.set_param(name, value)?;
        }
        Ok(())
    }

    /// Current value of an option, rendered as text.
    pub fn get_param(&self, name: &str) -> JitResult<String> {
        Ok(match name {
            "threshold" => self.threshold.to_string(),
            "function_threshold" => self.function_threshold.to_string(),
            "trace_eagerness" => self.trace_eagerness.to_string(),
            "trace_limit" => self.trace_limit.to_string(),
            "inlining" => u8::from(self.inlining).to_string(),
            "loop_longevity" => self.loop_longevity.to_string(),
            "retrace_limit" => self.retrace_limit.to_string(),
            "max_retrace_guards" => self.max_retrace_guards.to_string(),
            "max_unroll_loops" => self.max_unroll_loops.to_string(),
            "enable_opts" => self.enable_opts.to_string(),
            "max_inline_depth" => self.max_inline_depth.to_string(),
            other => return Err(JitError::UnknownParam(other.to_string())),
        })
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> JitResult<T> {
    value.parse().map_err(|_| JitError::BadParamValue {
        name: name.trim().to_string(),
        value: value.to_string(),
    })
}
