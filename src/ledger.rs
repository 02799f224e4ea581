use serde::Serialize;
use std::collections::BTreeMap;

/// The fixed set of fee heads a student's dues are tracked under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeeCategory {
    Tuition,
    Exam,
    Transport,
    Hostel,
    Registration,
}

impl FeeCategory {
    pub const ALL: [FeeCategory; 5] = [
        FeeCategory::Tuition,
        FeeCategory::Exam,
        FeeCategory::Transport,
        FeeCategory::Hostel,
        FeeCategory::Registration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FeeCategory::Tuition => "tuition",
            FeeCategory::Exam => "exam",
            FeeCategory::Transport => "transport",
            FeeCategory::Hostel => "hostel",
            FeeCategory::Registration => "registration",
        }
    }

    /// Report/CSV column label.
    pub fn label(self) -> &'static str {
        match self {
            FeeCategory::Tuition => "Tuition",
            FeeCategory::Exam => "Exam",
            FeeCategory::Transport => "Transport",
            FeeCategory::Hostel => "Hostel",
            FeeCategory::Registration => "Registration",
        }
    }

    pub fn parse(s: &str) -> Option<FeeCategory> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tuition" => Some(FeeCategory::Tuition),
            "exam" => Some(FeeCategory::Exam),
            "transport" => Some(FeeCategory::Transport),
            "hostel" => Some(FeeCategory::Hostel),
            "registration" => Some(FeeCategory::Registration),
            _ => None,
        }
    }
}

/// Half-up rounding to whole cents. Amounts are non-negative.
pub fn round_cents(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Half-up rounding to 1 decimal, used for report percentages.
pub fn round_one_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CategoryAmounts {
    pub total: f64,
    pub paid: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CategoryLine {
    pub total: f64,
    pub paid: f64,
    pub balance: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTotals {
    pub total_amount: f64,
    pub total_paid: f64,
    pub total_balance: f64,
}

/// Recompute per-category balances and the three aggregates from the
/// authoritative (total, paid) pairs. Pure; callers persist the result.
pub fn reconcile(
    amounts: &BTreeMap<FeeCategory, CategoryAmounts>,
) -> (BTreeMap<FeeCategory, CategoryLine>, LedgerTotals) {
    let mut lines = BTreeMap::new();
    let mut totals = LedgerTotals::default();
    for category in FeeCategory::ALL {
        let a = amounts.get(&category).copied().unwrap_or_default();
        let line = CategoryLine {
            total: round_cents(a.total),
            paid: round_cents(a.paid),
            balance: round_cents(a.total - a.paid),
        };
        totals.total_amount += line.total;
        totals.total_paid += line.paid;
        lines.insert(category, line);
    }
    totals.total_amount = round_cents(totals.total_amount);
    totals.total_paid = round_cents(totals.total_paid);
    totals.total_balance = round_cents(totals.total_amount - totals.total_paid);
    (lines, totals)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeStatus {
    Paid,
    Partial,
    Unpaid,
    NoFees,
}

impl FeeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FeeStatus::Paid => "paid",
            FeeStatus::Partial => "partial",
            FeeStatus::Unpaid => "unpaid",
            FeeStatus::NoFees => "no_fees",
        }
    }
}

pub fn classify(totals: &LedgerTotals) -> FeeStatus {
    if totals.total_amount <= 0.0 {
        FeeStatus::NoFees
    } else if totals.total_balance <= 0.0 {
        FeeStatus::Paid
    } else if totals.total_paid > 0.0 {
        FeeStatus::Partial
    } else {
        FeeStatus::Unpaid
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub total_amount: f64,
    pub total_paid: f64,
    pub total_balance: f64,
    pub student_count: usize,
    pub paid_count: usize,
    pub partial_count: usize,
    pub unpaid_count: usize,
}

/// Roll filtered per-student totals up into one dashboard row. Students with
/// no fees set contribute to student_count only.
pub fn summarize<I>(profiles: I) -> DashboardSummary
where
    I: IntoIterator<Item = LedgerTotals>,
{
    let mut out = DashboardSummary::default();
    for totals in profiles {
        out.student_count += 1;
        out.total_amount += totals.total_amount;
        out.total_paid += totals.total_paid;
        out.total_balance += totals.total_balance;
        match classify(&totals) {
            FeeStatus::Paid => out.paid_count += 1,
            FeeStatus::Partial => out.partial_count += 1,
            FeeStatus::Unpaid => out.unpaid_count += 1,
            FeeStatus::NoFees => {}
        }
    }
    out.total_amount = round_cents(out.total_amount);
    out.total_paid = round_cents(out.total_paid);
    out.total_balance = round_cents(out.total_balance);
    out
}
