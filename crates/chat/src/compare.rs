use std::fmt;

use kindle_llm::{ModelCost, ModelInfo};

const UNKNOWN: &str = "Unknown";
const SAME_COST_EPSILON: f64 = 0.000_001;
const GENERIC_TAG: &str = "LLM";

/// Direction of a change from the previous model to the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Increase,
    Decrease,
    Same,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub text: String,
}

impl Change {
    fn new(kind: ChangeKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// Display-ready facts about one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSummary {
    pub name: String,
    pub context: String,
    pub cost: String,
    pub tags: Vec<String>,
}

impl ModelSummary {
    pub fn of(model: &ModelInfo) -> Self {
        Self {
            name: model.display_name().to_string(),
            context: format_context_length(model.context_length),
            cost: format_cost(model.cost.as_ref()),
            tags: distinctive_tags(model),
        }
    }
}

/// Side-by-side comparison of the two most recently used models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelComparison {
    pub current: ModelSummary,
    pub previous: ModelSummary,
    pub context_change: Option<Change>,
    pub cost_change: Option<Change>,
}

impl ModelComparison {
    pub fn between(current: &ModelInfo, previous: &ModelInfo) -> Self {
        Self {
            current: ModelSummary::of(current),
            previous: ModelSummary::of(previous),
            context_change: compare_context_length(current, previous),
            cost_change: compare_cost(current, previous),
        }
    }

    pub fn has_changes(&self) -> bool {
        self.context_change.is_some() || self.cost_change.is_some()
    }
}

impl fmt::Display for ModelComparison {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, summary) in [("Previous", &self.previous), ("Current", &self.current)] {
            write!(
                formatter,
                "{label} model: {} (context: {}, cost: {})",
                summary.name, summary.context, summary.cost
            )?;
            if !summary.tags.is_empty() {
                write!(formatter, " [{}]", summary.tags.join(", "))?;
            }
            writeln!(formatter)?;
        }

        if self.has_changes() {
            writeln!(formatter, "Changes:")?;
            if let Some(change) = &self.context_change {
                writeln!(formatter, "  Context length: {}", change.text)?;
            }
            if let Some(change) = &self.cost_change {
                writeln!(formatter, "  Cost: {}", change.text)?;
            }
        }
        Ok(())
    }
}

/// Hint shown until two distinct models have been used.
pub fn insufficient_models_message(used: usize) -> String {
    format!("Use at least 2 different models to see comparison stats ({used}/2 models used)")
}

/// `1.2M`, `128K`, the raw count below a thousand, or `Unknown`.
pub fn format_context_length(length: Option<u64>) -> String {
    match length {
        Some(length) if length > 0 => format_token_count(length),
        _ => UNKNOWN.to_string(),
    }
}

fn format_token_count(length: u64) -> String {
    if length >= 1_000_000 {
        format!("{:.1}M", length as f64 / 1_000_000.0)
    } else if length >= 1_000 {
        format!("{:.0}K", length as f64 / 1_000.0)
    } else {
        length.to_string()
    }
}

/// Per-million-token price as `$x.xxxx/1M`, `$in/$out/1M`, `$in/1M in`, or `Unknown`.
pub fn format_cost(cost: Option<&ModelCost>) -> String {
    let Some(cost) = cost else {
        return UNKNOWN.to_string();
    };

    match (
        non_zero(cost.token_price),
        non_zero(cost.input_token_price),
        non_zero(cost.output_token_price),
    ) {
        (Some(flat), _, _) => format!("${flat:.4}/1M"),
        (None, Some(input), Some(output)) => format!("${input:.4}/${output:.4}/1M"),
        (None, Some(input), None) => format!("${input:.4}/1M in"),
        _ => UNKNOWN.to_string(),
    }
}

/// Tags worth showing; every catalog model is tagged `LLM`.
pub fn distinctive_tags(model: &ModelInfo) -> Vec<String> {
    model
        .tags
        .iter()
        .filter(|tag| tag.as_str() != GENERIC_TAG)
        .cloned()
        .collect()
}

fn non_zero(price: Option<f64>) -> Option<f64> {
    price.filter(|price| *price != 0.0)
}

fn compare_context_length(current: &ModelInfo, previous: &ModelInfo) -> Option<Change> {
    let previous = previous.context_length.filter(|length| *length > 0)?;
    let current = current.context_length.filter(|length| *length > 0)?;

    let diff = current as i128 - previous as i128;
    let percentage = diff as f64 / previous as f64 * 100.0;
    let magnitude = format_token_count(diff.unsigned_abs() as u64);

    Some(match diff {
        0 => Change::new(ChangeKind::Same, "Same"),
        diff if diff > 0 => Change::new(
            ChangeKind::Increase,
            format!("+{magnitude} (+{percentage:.1}%)"),
        ),
        _ => Change::new(
            ChangeKind::Decrease,
            format!("-{magnitude} ({percentage:.1}%)"),
        ),
    })
}

fn compare_cost(current: &ModelInfo, previous: &ModelInfo) -> Option<Change> {
    let previous = non_zero(previous.cost.as_ref()?.headline_price())?;
    let current = non_zero(current.cost.as_ref()?.headline_price())?;

    let diff = current - previous;
    let percentage = (diff / previous * 100.0).abs();

    Some(if diff.abs() < SAME_COST_EPSILON {
        Change::new(ChangeKind::Same, "Same cost")
    } else if diff > 0.0 {
        Change::new(
            ChangeKind::Increase,
            format!("+{percentage:.1}% more expensive"),
        )
    } else {
        Change::new(ChangeKind::Decrease, format!("{percentage:.1}% cheaper"))
    })
}
