//! Two-way matching of invoice lines against purchase-order lines.
//!
//! Pairing runs in two passes: identical descriptions first, then the
//! remaining lines go to a [`LinePairer`] (the decision oracle in
//! production). Every paired line is classified by its amount variance;
//! unpaired invoice lines are always material.
//!
//! The result depends only on the two line sets, the policy and the
//! pairer's answers. Nothing here touches storage.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::MatchingPolicy;
use crate::error::StageError;
use crate::instance::LineItem;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Classification of one compared line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Discrepancy {
    Match,
    TolerableVariance,
    MaterialVariance,
}

/// How an invoice line found (or failed to find) its counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Pairing {
    /// Same normalised description.
    Exact,
    /// Chosen by the pairer.
    Judged,
    /// Invoice without lines compared against the PO total.
    Total,
    /// No counterpart.
    Unpaired,
    /// Invoice-level charge that no known pattern explains.
    HeaderCharge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineOutcome {
    pub description: String,
    pub invoice_amount: Decimal,
    pub po_description: Option<String>,
    pub po_amount: Option<Decimal>,
    /// Invoice amount minus PO amount (the full amount when unpaired).
    pub variance: Decimal,
    pub pairing: Pairing,
    pub classification: Discrepancy,
    /// Which pattern explained a tolerable variance.
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Overall score in `[0, 1]`.
    pub score: f64,
    /// Per-line outcomes in invoice order, header charge last.
    pub lines: Vec<LineOutcome>,
    /// Invoice-level tax or fee recognised as an allowed adjustment.
    pub tax_adjustment: Option<Decimal>,
    pub invoice_total: Decimal,
    pub po_total: Decimal,
    /// PO lines nothing on the invoice was paired with.
    pub unmatched_po_lines: Vec<String>,
}

impl MatchResult {
    pub fn classifications(&self) -> Vec<Discrepancy> {
        self.lines.iter().map(|l| l.classification).collect()
    }

    pub fn count(&self, class: Discrepancy) -> usize {
        self.lines.iter().filter(|l| l.classification == class).count()
    }
}

/// The invoice side of a comparison.
#[derive(Debug, Clone, Copy)]
pub struct InvoiceSide<'a> {
    pub lines: &'a [LineItem],
    pub total: Decimal,
    pub subtotal: Option<Decimal>,
}

/// Chooses a PO counterpart for an invoice line whose description has no
/// exact equal. Returns an index into `candidates`, or `None`.
#[async_trait]
pub trait LinePairer: Send {
    async fn pair(
        &mut self,
        line: &LineItem,
        candidates: &[LineItem],
    ) -> Result<Option<usize>, StageError>;
}

// ---------------------------------------------------------------------------
// Amounts
// ---------------------------------------------------------------------------

/// Largest magnitude accepted for a single amount (10^15).
pub const AMOUNT_LIMIT: i64 = 1_000_000_000_000_000;

/// Reject `amount` when its magnitude exceeds [`AMOUNT_LIMIT`].
pub fn check_amount(what: &str, amount: Decimal) -> Result<(), StageError> {
    if amount.abs() > Decimal::from(AMOUNT_LIMIT) {
        return Err(StageError::validation(format!(
            "{what} {amount} exceeds the amount limit"
        )));
    }
    Ok(())
}

/// Sum of `amounts`, or a validation error on overflow.
pub fn checked_total(amounts: impl IntoIterator<Item = Decimal>) -> Result<Decimal, StageError> {
    amounts.into_iter().try_fold(Decimal::ZERO, |acc, amount| {
        acc.checked_add(amount)
            .ok_or_else(|| StageError::validation("amount total overflows"))
    })
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// `(matches + 0.5 × tolerable) / lines`, clamped to `[0, 1]`; 0 when empty.
pub fn score(classes: &[Discrepancy]) -> f64 {
    if classes.is_empty() {
        return 0.0;
    }
    let weighted: f64 = classes
        .iter()
        .map(|c| match c {
            Discrepancy::Match => 1.0,
            Discrepancy::TolerableVariance => 0.5,
            Discrepancy::MaterialVariance => 0.0,
        })
        .sum();
    (weighted / classes.len() as f64).clamp(0.0, 1.0)
}

/// Name of the pattern that explains `variance` on top of `base`, if any.
pub fn explain_variance(
    variance: Decimal,
    base: Decimal,
    policy: &MatchingPolicy,
) -> Option<String> {
    if variance <= Decimal::ZERO {
        return None;
    }
    let close = |expected: Decimal| (variance - expected).abs() <= policy.tolerance;
    if let Some(rate) = policy.tax_rates.iter().find(|rate| close(base * **rate)) {
        return Some(format!("tax at {}%", (*rate * Decimal::ONE_HUNDRED).normalize()));
    }
    policy
        .fixed_fees
        .iter()
        .find(|fee| close(**fee))
        .map(|fee| format!("fixed fee {}", fee.normalize()))
}

fn classify(variance: Decimal, base: Decimal, policy: &MatchingPolicy) -> (Discrepancy, Option<String>) {
    if variance.abs() <= policy.tolerance {
        return (Discrepancy::Match, None);
    }
    match explain_variance(variance, base, policy) {
        Some(why) => (Discrepancy::TolerableVariance, Some(why)),
        None => (Discrepancy::MaterialVariance, None),
    }
}

fn normalise(description: &str) -> String {
    description
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Compare an invoice against PO lines.
pub async fn two_way_match(
    invoice: InvoiceSide<'_>,
    po_lines: &[LineItem],
    policy: &MatchingPolicy,
    pairer: &mut dyn LinePairer,
) -> Result<MatchResult, StageError> {
    check_amount("invoice total", invoice.total)?;
    if let Some(subtotal) = invoice.subtotal {
        check_amount("invoice subtotal", subtotal)?;
    }
    for line in invoice.lines {
        check_amount(&format!("invoice line `{}`", line.description), line.amount)?;
    }
    for line in po_lines {
        check_amount(&format!("PO line `{}`", line.description), line.amount)?;
    }
    let po_total = checked_total(po_lines.iter().map(|l| l.amount))?;

    // An invoice without lines is compared as one line carrying its
    // pre-tax amount.
    let synthetic;
    let invoice_lines: &[LineItem] = if invoice.lines.is_empty() {
        synthetic = [LineItem {
            description: "invoice total".into(),
            quantity: Decimal::ONE,
            unit_price: invoice.subtotal.unwrap_or(invoice.total),
            amount: invoice.subtotal.unwrap_or(invoice.total),
        }];
        &synthetic
    } else {
        invoice.lines
    };

    let mut lines = if invoice.lines.is_empty() {
        vec![compare_total(&invoice_lines[0], po_lines, po_total, policy)]
    } else {
        pair_lines(invoice_lines, po_lines, policy, pairer).await?
    };

    let paired_po: Vec<&str> = lines
        .iter()
        .filter(|l| matches!(l.pairing, Pairing::Exact | Pairing::Judged))
        .filter_map(|l| l.po_description.as_deref())
        .collect();
    let unmatched_po_lines = if invoice.lines.is_empty() {
        Vec::new()
    } else {
        let mut remaining = paired_po;
        po_lines
            .iter()
            .filter(|po| {
                match remaining.iter().position(|d| *d == po.description) {
                    Some(i) => {
                        remaining.swap_remove(i);
                        false
                    }
                    None => true,
                }
            })
            .map(|po| po.description.clone())
            .collect()
    };

    // Header check: whatever the invoice total carries beyond its lines.
    let line_sum = checked_total(invoice_lines.iter().map(|l| l.amount))?;
    let header = invoice
        .total
        .checked_sub(line_sum)
        .ok_or_else(|| StageError::validation("invoice total minus its lines overflows"))?;
    let mut tax_adjustment = None;
    if header.abs() > policy.tolerance {
        match explain_variance(header, line_sum, policy) {
            Some(_) => tax_adjustment = Some(header),
            None => lines.push(LineOutcome {
                description: "unexplained invoice-level charge".into(),
                invoice_amount: header,
                po_description: None,
                po_amount: None,
                variance: header,
                pairing: Pairing::HeaderCharge,
                classification: Discrepancy::MaterialVariance,
                explanation: None,
            }),
        }
    }

    let classes: Vec<Discrepancy> = lines.iter().map(|l| l.classification).collect();
    Ok(MatchResult {
        score: score(&classes),
        lines,
        tax_adjustment,
        invoice_total: invoice.total,
        po_total,
        unmatched_po_lines,
    })
}

fn compare_total(
    line: &LineItem,
    po_lines: &[LineItem],
    po_total: Decimal,
    policy: &MatchingPolicy,
) -> LineOutcome {
    if po_lines.is_empty() {
        return unpaired(line);
    }
    let variance = line.amount - po_total;
    let (classification, explanation) = classify(variance, po_total, policy);
    LineOutcome {
        description: line.description.clone(),
        invoice_amount: line.amount,
        po_description: Some("purchase order total".into()),
        po_amount: Some(po_total),
        variance,
        pairing: Pairing::Total,
        classification,
        explanation,
    }
}

async fn pair_lines(
    invoice_lines: &[LineItem],
    po_lines: &[LineItem],
    policy: &MatchingPolicy,
    pairer: &mut dyn LinePairer,
) -> Result<Vec<LineOutcome>, StageError> {
    let mut po_taken = vec![false; po_lines.len()];
    let mut paired: Vec<Option<(usize, Pairing)>> = vec![None; invoice_lines.len()];

    // Pass 1: identical descriptions.
    for (i, line) in invoice_lines.iter().enumerate() {
        let key = normalise(&line.description);
        if let Some(j) = (0..po_lines.len())
            .find(|&j| !po_taken[j] && normalise(&po_lines[j].description) == key)
        {
            po_taken[j] = true;
            paired[i] = Some((j, Pairing::Exact));
        }
    }

    // Pass 2: ask the pairer about whatever is left.
    for (i, line) in invoice_lines.iter().enumerate() {
        if paired[i].is_some() {
            continue;
        }
        let open: Vec<usize> = (0..po_lines.len()).filter(|&j| !po_taken[j]).collect();
        if open.is_empty() {
            break;
        }
        let candidates: Vec<LineItem> = open.iter().map(|&j| po_lines[j].clone()).collect();
        if let Some(choice) = pairer.pair(line, &candidates).await? {
            if let Some(&j) = open.get(choice) {
                po_taken[j] = true;
                paired[i] = Some((j, Pairing::Judged));
            }
        }
    }

    Ok(invoice_lines
        .iter()
        .zip(paired)
        .map(|(line, pair)| match pair {
            Some((j, pairing)) => {
                let po = &po_lines[j];
                let variance = line.amount - po.amount;
                let (classification, explanation) = classify(variance, po.amount, policy);
                LineOutcome {
                    description: line.description.clone(),
                    invoice_amount: line.amount,
                    po_description: Some(po.description.clone()),
                    po_amount: Some(po.amount),
                    variance,
                    pairing,
                    classification,
                    explanation,
                }
            }
            None => unpaired(line),
        })
        .collect())
}

fn unpaired(line: &LineItem) -> LineOutcome {
    LineOutcome {
        description: line.description.clone(),
        invoice_amount: line.amount,
        po_description: None,
        po_amount: None,
        variance: line.amount,
        pairing: Pairing::Unpaired,
        classification: Discrepancy::MaterialVariance,
        explanation: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Answers from a fixed script and counts how often it was asked.
    struct Scripted {
        answers: Vec<Option<usize>>,
        asked: usize,
    }

    impl Scripted {
        fn new(answers: Vec<Option<usize>>) -> Self {
            Self { answers, asked: 0 }
        }
    }

    #[async_trait]
    impl LinePairer for Scripted {
        async fn pair(
            &mut self,
            _line: &LineItem,
            _candidates: &[LineItem],
        ) -> Result<Option<usize>, StageError> {
            let answer = self.answers.get(self.asked).copied().flatten();
            self.asked += 1;
            Ok(answer)
        }
    }

    fn line(description: &str, amount: i64) -> LineItem {
        LineItem::new(description, Decimal::ONE, Decimal::from(amount))
    }

    fn side(lines: &[LineItem], total: i64) -> InvoiceSide<'_> {
        InvoiceSide {
            lines,
            total: Decimal::from(total),
            subtotal: None,
        }
    }

    #[tokio::test]
    async fn tax_on_top_of_matching_lines_scores_full() {
        let invoice = [line("Cloud Hosting", 230)];
        let po = [line("Cloud Hosting", 230)];
        let mut pairer = Scripted::new(vec![]);

        let result = two_way_match(side(&invoice, 253), &po, &MatchingPolicy::default(), &mut pairer)
            .await
            .unwrap();

        assert!(result.score >= 0.9);
        assert_eq!(result.classifications(), vec![Discrepancy::Match]);
        assert_eq!(result.tax_adjustment, Some(Decimal::from(23)));
        assert_eq!(pairer.asked, 0);
    }

    #[tokio::test]
    async fn wildly_different_total_scores_zero() {
        let po = [line("Cloud Hosting", 230)];
        let mut pairer = Scripted::new(vec![]);

        let result = two_way_match(side(&[], 9999), &po, &MatchingPolicy::default(), &mut pairer)
            .await
            .unwrap();

        assert!(result.score < 0.9);
        assert_eq!(result.classifications(), vec![Discrepancy::MaterialVariance]);
        assert_eq!(result.lines[0].pairing, Pairing::Total);
    }

    #[tokio::test]
    async fn judged_pairing_for_different_descriptions() {
        let invoice = [line("Cloud Hosting", 230)];
        let po = [line("Hosting Sub", 230)];
        let mut pairer = Scripted::new(vec![Some(0)]);

        let result = two_way_match(side(&invoice, 230), &po, &MatchingPolicy::default(), &mut pairer)
            .await
            .unwrap();

        assert_eq!(pairer.asked, 1);
        assert_eq!(result.lines[0].pairing, Pairing::Judged);
        assert_eq!(result.lines[0].po_description.as_deref(), Some("Hosting Sub"));
        assert!((result.score - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn refused_or_invalid_pairing_leaves_line_unpaired() {
        let invoice = [line("Consulting", 100), line("Travel", 50)];
        let po = [line("Hosting", 100)];
        let mut pairer = Scripted::new(vec![None, Some(7)]);

        let result = two_way_match(side(&invoice, 150), &po, &MatchingPolicy::default(), &mut pairer)
            .await
            .unwrap();

        assert_eq!(
            result.classifications(),
            vec![Discrepancy::MaterialVariance, Discrepancy::MaterialVariance]
        );
        assert!(result.lines.iter().all(|l| l.pairing == Pairing::Unpaired));
        assert_eq!(result.unmatched_po_lines, vec!["Hosting".to_string()]);
        assert_eq!(result.score, 0.0);
    }

    #[tokio::test]
    async fn exact_pairs_are_reserved_before_judging() {
        let invoice = [line("Support", 40), line("Cloud Hosting", 230)];
        let po = [line("Cloud hosting", 230), line("Support plan", 40)];
        // The pairer only sees "Support plan" as a candidate.
        let mut pairer = Scripted::new(vec![Some(0)]);

        let result = two_way_match(side(&invoice, 270), &po, &MatchingPolicy::default(), &mut pairer)
            .await
            .unwrap();

        assert_eq!(result.lines[0].po_description.as_deref(), Some("Support plan"));
        assert_eq!(result.lines[1].pairing, Pairing::Exact);
        assert!(result.unmatched_po_lines.is_empty());
    }

    #[tokio::test]
    async fn line_level_tax_is_tolerable() {
        let invoice = [line("Cloud Hosting", 253)];
        let po = [line("Cloud Hosting", 230)];
        let mut pairer = Scripted::new(vec![]);

        let result = two_way_match(side(&invoice, 253), &po, &MatchingPolicy::default(), &mut pairer)
            .await
            .unwrap();

        assert_eq!(result.classifications(), vec![Discrepancy::TolerableVariance]);
        assert_eq!(result.lines[0].explanation.as_deref(), Some("tax at 10%"));
        assert!((result.score - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unexplained_header_charge_counts_as_material_line() {
        let invoice = [line("Cloud Hosting", 230)];
        let po = [line("Cloud Hosting", 230)];
        let mut pairer = Scripted::new(vec![]);

        let result = two_way_match(side(&invoice, 261), &po, &MatchingPolicy::default(), &mut pairer)
            .await
            .unwrap();

        assert_eq!(result.lines.len(), 2);
        assert_eq!(result.lines[1].pairing, Pairing::HeaderCharge);
        assert_eq!(result.tax_adjustment, None);
        assert!((result.score - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn lineless_invoice_uses_subtotal_then_header_tax() {
        let po = [line("Cloud Hosting", 230)];
        let invoice = InvoiceSide {
            lines: &[],
            total: Decimal::from(253),
            subtotal: Some(Decimal::from(230)),
        };
        let mut pairer = Scripted::new(vec![]);

        let result = two_way_match(invoice, &po, &MatchingPolicy::default(), &mut pairer)
            .await
            .unwrap();

        assert_eq!(result.classifications(), vec![Discrepancy::Match]);
        assert_eq!(result.tax_adjustment, Some(Decimal::from(23)));
    }

    #[tokio::test]
    async fn fixed_fee_explains_variance() {
        let policy = MatchingPolicy {
            fixed_fees: vec![Decimal::from(15)],
            ..MatchingPolicy::default()
        };
        let invoice = [line("Hardware", 115)];
        let po = [line("Hardware", 100)];
        let mut pairer = Scripted::new(vec![]);

        let result = two_way_match(side(&invoice, 115), &po, &policy, &mut pairer)
            .await
            .unwrap();

        // 15% is not a configured rate, the fee is.
        assert_eq!(result.lines[0].explanation.as_deref(), Some("fixed fee 15"));
    }

    #[tokio::test]
    async fn no_purchase_order_means_everything_unpaired() {
        let invoice = [line("Cloud Hosting", 230)];
        let mut pairer = Scripted::new(vec![]);

        let result = two_way_match(side(&invoice, 230), &[], &MatchingPolicy::default(), &mut pairer)
            .await
            .unwrap();

        assert_eq!(result.score, 0.0);
        assert_eq!(pairer.asked, 0);
    }

    #[test]
    fn score_weights_and_bounds() {
        use Discrepancy::*;
        assert_eq!(score(&[]), 0.0);
        assert_eq!(score(&[Match, Match]), 1.0);
        assert_eq!(score(&[TolerableVariance, MaterialVariance]), 0.25);
    }

    #[test]
    fn score_never_increases_with_more_material_lines() {
        use Discrepancy::*;
        for total in 1..=8usize {
            for tolerable in 0..=total {
                let mut previous = f64::INFINITY;
                for material in 0..=(total - tolerable) {
                    let matched = total - tolerable - material;
                    let mut classes = vec![Match; matched];
                    classes.extend(vec![TolerableVariance; tolerable]);
                    classes.extend(vec![MaterialVariance; material]);
                    let s = score(&classes);
                    assert!(s <= previous, "score rose at total={total} material={material}");
                    assert!((0.0..=1.0).contains(&s));
                    previous = s;
                }
            }
        }
    }

    #[tokio::test]
    async fn oversized_amounts_fail_validation_instead_of_overflowing() {
        let half = Decimal::MAX / Decimal::TWO + Decimal::ONE;
        let huge = |description: &str| LineItem {
            description: description.into(),
            quantity: Decimal::ONE,
            unit_price: half,
            amount: half,
        };
        let invoice = [huge("Rack"), huge("Cable")];
        let po = [line("Rack", 10)];
        let side = InvoiceSide {
            lines: &invoice,
            total: Decimal::MAX,
            subtotal: None,
        };

        let result =
            two_way_match(side, &po, &MatchingPolicy::default(), &mut Scripted::new(vec![])).await;
        assert!(matches!(result, Err(StageError::Validation(_))));
    }

    #[test]
    fn checked_total_reports_overflow() {
        assert_eq!(
            checked_total([Decimal::ONE, Decimal::TWO]).unwrap(),
            Decimal::from(3)
        );
        assert!(matches!(
            checked_total([Decimal::MAX, Decimal::ONE]),
            Err(StageError::Validation(_))
        ));
        assert!(check_amount("total", Decimal::from(AMOUNT_LIMIT)).is_ok());
        assert!(check_amount("total", -Decimal::from(AMOUNT_LIMIT) - Decimal::ONE).is_err());
    }

    #[test]
    fn normalise_ignores_case_and_punctuation() {
        assert_eq!(normalise("  Cloud-Hosting (Annual) "), "cloud hosting annual");
    }
}
