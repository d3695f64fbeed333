//! Per-channel filter chain with named stages.

use crate::config::FilterConfig;
use crate::dsp::filter::StreamingFilter;
use crate::error::Result;

/// The job a filter stage does in the chain. Stage names double as the
/// variant names of archive streams tapped after that stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterRole {
    CtcssNotch,
    Highpass,
    Lowpass,
}

impl FilterRole {
    pub fn name(&self) -> &'static str {
        match self {
            FilterRole::CtcssNotch => "ctcss_removed",
            FilterRole::Highpass => "highpass",
            FilterRole::Lowpass => "lowpass",
        }
    }
}

/// A point in the chain where an archive stream can capture audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapPoint {
    /// Samples as received, before any filtering.
    Raw,
    /// Samples right after the given stage.
    After(FilterRole),
    /// Samples after the full chain.
    Output,
}

impl TapPoint {
    /// Parses a configured stream name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "output" => Some(TapPoint::Output),
            "raw" => Some(TapPoint::Raw),
            "ctcss_removed" => Some(TapPoint::After(FilterRole::CtcssNotch)),
            "highpass" => Some(TapPoint::After(FilterRole::Highpass)),
            "lowpass" => Some(TapPoint::After(FilterRole::Lowpass)),
            _ => None,
        }
    }

    /// File name suffix for streams captured here. The final output has none.
    pub fn variant(&self) -> Option<&'static str> {
        match self {
            TapPoint::Raw => Some("raw"),
            TapPoint::After(role) => Some(role.name()),
            TapPoint::Output => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilterStage {
    pub role: FilterRole,
    pub filter: StreamingFilter,
}

/// Ordered cascade of streaming filters owned by one channel.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    stages: Vec<FilterStage>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the standard voice chain: optional CTCSS notch, highpass, lowpass.
    pub fn voice(sample_rate: u32, config: &FilterConfig, ctcss_hz: Option<f64>) -> Result<Self> {
        let mut chain = Self::new();
        if let Some(tone) = ctcss_hz {
            let q = tone / config.ctcss_notch_bandwidth_hz;
            chain.push(
                FilterRole::CtcssNotch,
                StreamingFilter::notch(sample_rate, tone, q)?,
            );
        }
        chain.push(
            FilterRole::Highpass,
            StreamingFilter::highpass(sample_rate, config.highpass_order, config.highpass_hz)?,
        );
        chain.push(
            FilterRole::Lowpass,
            StreamingFilter::lowpass(sample_rate, config.lowpass_order, config.lowpass_hz)?,
        );
        Ok(chain)
    }

    pub fn push(&mut self, role: FilterRole, filter: StreamingFilter) {
        self.stages.push(FilterStage { role, filter });
    }

    pub fn stages(&self) -> &[FilterStage] {
        &self.stages
    }

    pub fn has_stage(&self, role: FilterRole) -> bool {
        self.stages.iter().any(|s| s.role == role)
    }

    /// Runs every stage over `samples` in place, calling `tap` before the
    /// first stage, after each stage and after the last one.
    pub fn process<F>(&mut self, samples: &mut [f32], mut tap: F)
    where
        F: FnMut(TapPoint, &[f32]),
    {
        tap(TapPoint::Raw, samples);
        for stage in &mut self.stages {
            stage.filter.filter_in_place(samples);
            tap(TapPoint::After(stage.role), samples);
        }
        tap(TapPoint::Output, samples);
    }

    /// Resets every stage. Called once per session end.
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.filter.reset();
        }
    }
}
