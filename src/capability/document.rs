use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{Capability, CapabilityVariant, StageContext, StageOutput};
use crate::error::StageError;
use crate::job::StageName;

const FINANCIAL_TERMS: &[&str] = &[
    "revenue",
    "income",
    "profit",
    "margin",
    "earnings",
    "ebitda",
    "cash flow",
    "balance sheet",
    "assets",
    "liabilities",
    "equity",
    "dividend",
    "fiscal",
    "quarter",
    "guidance",
];

const GROWTH_TERMS: &[&str] = &[
    "growth",
    "increase",
    "increased",
    "record",
    "expansion",
    "improved",
    "exceeded",
    "strong",
];

const PRESSURE_TERMS: &[&str] = &[
    "decline",
    "decreased",
    "headwind",
    "weak",
    "impairment",
    "slowdown",
    "shortfall",
];

const RISK_TERMS: &[&str] = &[
    "risk",
    "debt",
    "loss",
    "litigation",
    "volatility",
    "uncertainty",
    "default",
    "restructuring",
    "covenant",
    "inflation",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DocumentOptions {
    pub max_document_bytes: u64,
    pub max_highlights: usize,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            max_document_bytes: 50 * 1024 * 1024,
            max_highlights: 5,
        }
    }
}

/// Live analysis over the document text itself.
#[derive(Debug, Clone, Default)]
pub struct DocumentCapability {
    options: DocumentOptions,
}

impl DocumentCapability {
    pub fn new(options: DocumentOptions) -> Self {
        Self { options }
    }

    async fn load(&self, input_ref: &str) -> Result<Vec<u8>, StageError> {
        let path = Path::new(input_ref);
        let meta = tokio::fs::metadata(path).await.map_err(|err| io_error(input_ref, err))?;
        if !meta.is_file() {
            return Err(StageError::fatal(format!(
                "input '{input_ref}' is not a regular file"
            )));
        }
        if meta.len() > self.options.max_document_bytes {
            return Err(StageError::fatal(format!(
                "input '{input_ref}' is {} bytes; the limit is {}",
                meta.len(),
                self.options.max_document_bytes
            )));
        }
        tokio::fs::read(path)
            .await
            .map_err(|err| io_error(input_ref, err))
    }
}

fn io_error(input_ref: &str, err: std::io::Error) -> StageError {
    match err.kind() {
        ErrorKind::NotFound => StageError::fatal(format!("input '{input_ref}' not found")),
        ErrorKind::PermissionDenied => {
            StageError::fatal(format!("input '{input_ref}' is not readable"))
        }
        _ => StageError::transient(format!("failed to read '{input_ref}': {err}")),
    }
}

#[async_trait]
impl Capability for DocumentCapability {
    fn variant(&self) -> CapabilityVariant {
        CapabilityVariant::Live
    }

    async fn run(&self, stage: StageName, ctx: &StageContext) -> Result<StageOutput, StageError> {
        let data = self.load(&ctx.input_ref).await?;
        let text = extract_text(&data);
        debug!(
            stage = %stage,
            bytes = data.len(),
            chars = text.len(),
            "Document text extracted"
        );
        if text.trim().is_empty() {
            return Err(StageError::fatal(format!(
                "no readable text in '{}'",
                ctx.input_ref
            )));
        }

        let content = match stage {
            StageName::FinancialAnalysis => self.financial_analysis(&text, &ctx.query),
            StageName::InvestmentAnalysis => investment_analysis(&text, ctx),
            StageName::RiskAssessment => risk_assessment(&text),
            StageName::Verification => verification(&data, &text)?,
        };
        let tokens = estimate_tokens(&text) + estimate_tokens(&content);
        Ok(StageOutput::text(content).with_tokens(tokens))
    }
}

impl DocumentCapability {
    fn financial_analysis(&self, text: &str, query: &str) -> String {
        let figures = monetary_figures(text);
        let highlights: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| {
                let lower = line.to_lowercase();
                FINANCIAL_TERMS.iter().any(|term| lower.contains(term))
            })
            .take(self.options.max_highlights)
            .collect();

        let mut out = format!(
            "Financial analysis for: {query}\nWords: {}\nMonetary figures found: {}",
            text.split_whitespace().count(),
            figures.len()
        );
        if !figures.is_empty() {
            let shown: Vec<&str> = figures
                .iter()
                .take(self.options.max_highlights)
                .map(String::as_str)
                .collect();
            out.push_str(&format!(" ({})", shown.join(", ")));
        }
        if !highlights.is_empty() {
            out.push_str("\nKey lines:");
            for line in highlights {
                out.push_str("\n- ");
                out.push_str(line);
            }
        }
        out
    }
}

fn investment_analysis(text: &str, ctx: &StageContext) -> String {
    let lower = text.to_lowercase();
    let growth = count_terms(&lower, GROWTH_TERMS);
    let pressure = count_terms(&lower, PRESSURE_TERMS);
    let stance = if growth > pressure * 2 {
        "constructive"
    } else if pressure > growth {
        "cautious"
    } else {
        "neutral"
    };
    let basis = if ctx.prior_output(StageName::FinancialAnalysis).is_some() {
        "building on the financial analysis"
    } else {
        "without a prior financial analysis"
    };
    format!(
        "Investment view ({basis}): {stance}\nGrowth signals: {growth}\nPressure signals: {pressure}"
    )
}

fn risk_assessment(text: &str) -> String {
    let lower = text.to_lowercase();
    let mut tallies: Vec<(&str, usize)> = RISK_TERMS
        .iter()
        .map(|term| (*term, lower.matches(term).count()))
        .filter(|(_, count)| *count > 0)
        .collect();
    tallies.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    let total: usize = tallies.iter().map(|(_, count)| count).sum();
    let words = text.split_whitespace().count().max(1);
    let density = total as f64 * 1_000.0 / words as f64;
    let rating = if density >= 10.0 {
        "high"
    } else if density >= 3.0 {
        "moderate"
    } else {
        "low"
    };

    let mut out = format!("Risk rating: {rating} ({total} risk mention(s), {density:.1} per 1k words)");
    for (term, count) in tallies {
        out.push_str(&format!("\n- {term}: {count}"));
    }
    out
}

fn verification(data: &[u8], text: &str) -> Result<String, StageError> {
    let lower = text.to_lowercase();
    let vocabulary = count_terms(&lower, FINANCIAL_TERMS);
    if vocabulary == 0 {
        return Err(StageError::fatal(
            "document does not contain financial reporting vocabulary",
        ));
    }
    let digest = Sha256::digest(data);
    Ok(format!(
        "Verified financial document\nsha256: {digest:x}\nFinancial terms matched: {vocabulary}"
    ))
}

fn count_terms(lower: &str, terms: &[&str]) -> usize {
    terms.iter().map(|term| lower.matches(term).count()).sum()
}

/// Keeps printable runs of at least four characters so binary containers
/// such as PDF still yield their embedded plain text.
fn extract_text(data: &[u8]) -> String {
    let decoded = String::from_utf8_lossy(data);
    let mut out = String::with_capacity(decoded.len());
    let mut run = String::new();
    for ch in decoded.chars() {
        if ch == '\n' || ch == '\r' {
            flush_run(&mut out, &mut run);
            out.push('\n');
        } else if ch == '\t' || (!ch.is_control() && ch != char::REPLACEMENT_CHARACTER) {
            run.push(ch);
        } else {
            flush_run(&mut out, &mut run);
        }
    }
    flush_run(&mut out, &mut run);
    out
}

fn flush_run(out: &mut String, run: &mut String) {
    if run.trim().chars().count() >= 4 {
        out.push_str(run);
    } else if !run.is_empty() && !out.ends_with(' ') && !out.ends_with('\n') {
        out.push(' ');
    }
    run.clear();
}

fn monetary_figures(text: &str) -> Vec<String> {
    let mut figures = Vec::new();
    for token in text.split_whitespace() {
        let trimmed = token.trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '(' | ')' | '.'));
        let Some(rest) = trimmed.strip_prefix('$') else {
            continue;
        };
        if rest.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            figures.push(trimmed.to_string());
        }
    }
    figures
}

fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_drops_binary_noise() {
        let mut data = b"%PDF-1.7\n".to_vec();
        data.extend_from_slice(&[0, 159, 146, 150, 1, 2]);
        data.extend_from_slice(b"Total revenue $4.2B\n");
        let text = extract_text(&data);
        assert!(text.contains("Total revenue $4.2B"));
        assert!(!text.contains('\u{0}'));
    }

    #[test]
    fn monetary_figures_are_collected() {
        let figures = monetary_figures("Revenue was $12.5M (up from $10M), costs $abc.");
        assert_eq!(figures, vec!["$12.5M", "$10M"]);
    }

    #[test]
    fn verification_rejects_non_financial_text() {
        let err = verification(b"milk eggs bread", "milk eggs bread").unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn risk_rating_scales_with_density() {
        let out = risk_assessment("debt debt loss risk volatility");
        assert!(out.starts_with("Risk rating: high"));
        assert!(out.contains("- debt: 2"));
    }
}
