use crate::db::fee_columns;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    bad_params, commit_failed, db_conn, forbidden, get_optional_str, get_required_str, not_found,
    parse_date, query_failed, require_session, row_exists, tx_failed, update_failed, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{self, CategoryAmounts, CategoryLine, FeeCategory, LedgerTotals};
use crate::session::StaffSession;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StudentRef {
    id: String,
    name: String,
    class_id: String,
    register_no: Option<String>,
}

#[derive(Debug, Clone)]
struct ProfileRow {
    lines: BTreeMap<FeeCategory, CategoryLine>,
    totals: LedgerTotals,
    updated_at: Option<String>,
    recorded_by: Option<String>,
}

impl ProfileRow {
    fn amounts(&self) -> BTreeMap<FeeCategory, CategoryAmounts> {
        self.lines
            .iter()
            .map(|(&c, line)| {
                (
                    c,
                    CategoryAmounts {
                        total: line.total,
                        paid: line.paid,
                    },
                )
            })
            .collect()
    }
}

fn empty_profile() -> ProfileRow {
    let amounts = BTreeMap::new();
    let (lines, totals) = ledger::reconcile(&amounts);
    ProfileRow {
        lines,
        totals,
        updated_at: None,
        recorded_by: None,
    }
}

fn profile_select_sql() -> String {
    let mut cols = Vec::new();
    for category in FeeCategory::ALL {
        let (total, paid, balance) = fee_columns(category);
        cols.push(total);
        cols.push(paid);
        cols.push(balance);
    }
    cols.extend(["total_amount", "total_paid", "total_balance"]);
    format!(
        "SELECT {}, updated_at, recorded_by FROM fees WHERE student_id = ?",
        cols.join(", ")
    )
}

fn read_profile(conn: &Connection, student_id: &str) -> Result<Option<ProfileRow>, HandlerErr> {
    conn.query_row(&profile_select_sql(), [student_id], |r| {
        let mut lines = BTreeMap::new();
        for (i, category) in FeeCategory::ALL.iter().enumerate() {
            lines.insert(
                *category,
                CategoryLine {
                    total: r.get(3 * i)?,
                    paid: r.get(3 * i + 1)?,
                    balance: r.get(3 * i + 2)?,
                },
            );
        }
        let totals = LedgerTotals {
            total_amount: r.get(15)?,
            total_paid: r.get(16)?,
            total_balance: r.get(17)?,
        };
        Ok(ProfileRow {
            lines,
            totals,
            updated_at: r.get(18)?,
            recorded_by: r.get(19)?,
        })
    })
    .optional()
    .map_err(query_failed)
}

fn write_profile(
    conn: &Connection,
    student_id: &str,
    lines: &BTreeMap<FeeCategory, CategoryLine>,
    totals: &LedgerTotals,
    recorded_by: &str,
) -> Result<String, HandlerErr> {
    let mut cols: Vec<&'static str> = vec!["student_id"];
    let mut binds: Vec<Value> = vec![Value::Text(student_id.to_string())];
    for category in FeeCategory::ALL {
        let (total, paid, balance) = fee_columns(category);
        let line = lines.get(&category).copied().unwrap_or_default();
        cols.extend([total, paid, balance]);
        binds.push(Value::Real(line.total));
        binds.push(Value::Real(line.paid));
        binds.push(Value::Real(line.balance));
    }
    let updated_at = chrono::Utc::now().to_rfc3339();
    cols.extend([
        "total_amount",
        "total_paid",
        "total_balance",
        "updated_at",
        "recorded_by",
    ]);
    binds.push(Value::Real(totals.total_amount));
    binds.push(Value::Real(totals.total_paid));
    binds.push(Value::Real(totals.total_balance));
    binds.push(Value::Text(updated_at.clone()));
    binds.push(Value::Text(recorded_by.to_string()));

    let placeholders = std::iter::repeat("?")
        .take(cols.len())
        .collect::<Vec<_>>()
        .join(", ");
    let updates = cols
        .iter()
        .skip(1)
        .map(|c| format!("{} = excluded.{}", c, c))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO fees({}) VALUES({})
         ON CONFLICT(student_id) DO UPDATE SET {}",
        cols.join(", "),
        placeholders,
        updates
    );
    conn.execute(&sql, params_from_iter(binds))
        .map_err(|e| update_failed(e, "fees"))?;
    Ok(updated_at)
}

fn find_student(conn: &Connection, student_id: &str) -> Result<StudentRef, HandlerErr> {
    conn.query_row(
        "SELECT id, name, class_id, register_no FROM students WHERE id = ?",
        [student_id],
        |r| {
            Ok(StudentRef {
                id: r.get(0)?,
                name: r.get(1)?,
                class_id: r.get(2)?,
                register_no: r.get(3)?,
            })
        },
    )
    .optional()
    .map_err(query_failed)?
    .ok_or_else(|| not_found("student not found"))
}

fn profile_json(student: &StudentRef, profile: &ProfileRow) -> serde_json::Value {
    let mut categories = serde_json::Map::new();
    for (category, line) in &profile.lines {
        categories.insert(
            category.as_str().to_string(),
            json!({
                "total": line.total,
                "paid": line.paid,
                "balance": line.balance
            }),
        );
    }
    json!({
        "studentId": student.id,
        "studentName": student.name,
        "classId": student.class_id,
        "registerNo": student.register_no,
        "categories": categories,
        "totalAmount": profile.totals.total_amount,
        "totalPaid": profile.totals.total_paid,
        "totalBalance": profile.totals.total_balance,
        "status": ledger::classify(&profile.totals).as_str(),
        "updatedAt": profile.updated_at,
        "recordedBy": profile.recorded_by
    })
}

fn parse_category_totals(
    params: &serde_json::Value,
) -> Result<BTreeMap<FeeCategory, f64>, HandlerErr> {
    let Some(obj) = params.get("categories").and_then(|v| v.as_object()) else {
        return Err(bad_params("missing categories object"));
    };
    if obj.is_empty() {
        return Err(bad_params("categories must not be empty"));
    }
    let mut out = BTreeMap::new();
    for (key, value) in obj {
        let Some(category) = FeeCategory::parse(key) else {
            return Err(bad_params(format!("unknown fee category: {}", key)));
        };
        let Some(amount) = value.as_f64() else {
            return Err(bad_params(format!("{} total must be a number", key)));
        };
        if !amount.is_finite() || amount < 0.0 {
            return Err(bad_params(format!("{} total must be non-negative", key)));
        }
        out.insert(category, ledger::round_cents(amount));
    }
    Ok(out)
}

/// Create or update category totals for a student. Merge semantics: only
/// supplied categories change; paid amounts are always preserved.
fn fees_upsert(
    conn: &Connection,
    session: &StaffSession,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let new_totals = parse_category_totals(params)?;
    let student = find_student(conn, &student_id)?;

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    let existing = read_profile(&tx, &student_id)?.unwrap_or_else(empty_profile);
    let mut amounts = existing.amounts();
    for (category, total) in &new_totals {
        let entry = amounts.entry(*category).or_default();
        if *total + 1e-9 < entry.paid {
            return Err(HandlerErr {
                code: "invalid_total",
                message: format!(
                    "{} total {} is below the amount already paid {}",
                    category.as_str(),
                    total,
                    entry.paid
                ),
                details: Some(json!({
                    "category": category.as_str(),
                    "paid": entry.paid
                })),
            });
        }
        entry.total = *total;
    }
    let (lines, totals) = ledger::reconcile(&amounts);
    let updated_at = write_profile(&tx, &student_id, &lines, &totals, &session.name)?;
    tx.commit().map_err(commit_failed)?;

    let profile = ProfileRow {
        lines,
        totals,
        updated_at: Some(updated_at),
        recorded_by: Some(session.name.clone()),
    };
    Ok(json!({ "profile": profile_json(&student, &profile) }))
}

/// Apply one payment to one category and append the transaction row, as a
/// single unit. Validation runs against the committed row inside the
/// transaction, so racing submissions cannot both spend the same balance.
fn fees_record_payment(
    conn: &Connection,
    session: &StaffSession,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let category_raw = get_required_str(params, "category")?;
    let category = FeeCategory::parse(&category_raw)
        .ok_or_else(|| bad_params(format!("unknown fee category: {}", category_raw)))?;
    let amount = params
        .get("amount")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| bad_params("missing amount"))?;
    if !amount.is_finite() || amount <= 0.0 {
        return Err(bad_params("amount must be positive"));
    }
    let amount = ledger::round_cents(amount);
    if amount <= 0.0 {
        return Err(bad_params("amount must be positive"));
    }
    let date = match get_optional_str(params, "date")? {
        Some(raw) => parse_date(&raw)?,
        None => chrono::Utc::now().date_naive(),
    };
    let student = find_student(conn, &student_id)?;

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    let Some(existing) = read_profile(&tx, &student_id)? else {
        return Err(not_found("fee profile not found"));
    };
    let line = existing.lines.get(&category).copied().unwrap_or_default();
    if amount > line.balance + 1e-9 {
        return Err(HandlerErr {
            code: "overpayment",
            message: format!(
                "payment {} exceeds {} balance {}",
                amount,
                category.as_str(),
                line.balance
            ),
            details: Some(json!({
                "category": category.as_str(),
                "balance": line.balance
            })),
        });
    }

    let mut amounts = existing.amounts();
    let entry = amounts.entry(category).or_default();
    entry.paid = ledger::round_cents(entry.paid + amount);
    let (lines, totals) = ledger::reconcile(&amounts);
    let updated_at = write_profile(&tx, &student_id, &lines, &totals, &session.name)?;

    let transaction_id = Uuid::new_v4().to_string();
    let timestamp = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO fee_transactions(id, fee_id, fee_type, amount, date, recorded_by, timestamp)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &transaction_id,
            &student_id,
            category.as_str(),
            amount,
            date.format("%Y-%m-%d").to_string(),
            &session.name,
            &timestamp,
        ),
    )
    .map_err(|e| update_failed(e, "fee_transactions"))?;
    tx.commit().map_err(commit_failed)?;

    let profile = ProfileRow {
        lines,
        totals,
        updated_at: Some(updated_at),
        recorded_by: Some(session.name.clone()),
    };
    Ok(json!({
        "transactionId": transaction_id,
        "profile": profile_json(&student, &profile)
    }))
}

fn fees_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student = find_student(conn, &student_id)?;
    let profile = read_profile(conn, &student_id)?.unwrap_or_else(empty_profile);
    Ok(json!({ "profile": profile_json(&student, &profile) }))
}

fn fees_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", [&class_id])? {
        return Err(not_found("class not found"));
    }
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.register_no,
                    COALESCE(f.total_amount, 0),
                    COALESCE(f.total_paid, 0),
                    COALESCE(f.total_balance, 0)
             FROM students s
             LEFT JOIN fees f ON f.student_id = s.id
             WHERE s.class_id = ?
             ORDER BY s.name",
        )
        .map_err(query_failed)?;
    let rows = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let register_no: Option<String> = r.get(2)?;
            let totals = LedgerTotals {
                total_amount: r.get(3)?,
                total_paid: r.get(4)?,
                total_balance: r.get(5)?,
            };
            Ok(json!({
                "studentId": id,
                "studentName": name,
                "registerNo": register_no,
                "totalAmount": totals.total_amount,
                "totalPaid": totals.total_paid,
                "totalBalance": totals.total_balance,
                "status": ledger::classify(&totals).as_str()
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "rows": rows }))
}

fn fees_transactions(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    find_student(conn, &student_id)?;
    let category = match get_optional_str(params, "category")? {
        Some(raw) => Some(
            FeeCategory::parse(&raw)
                .ok_or_else(|| bad_params(format!("unknown fee category: {}", raw)))?,
        ),
        None => None,
    };
    let mut stmt = conn
        .prepare(
            "SELECT id, fee_id, fee_type, amount, date, recorded_by, timestamp
             FROM fee_transactions
             WHERE fee_id = ?1 AND (?2 IS NULL OR fee_type = ?2)
             ORDER BY timestamp DESC, rowid DESC",
        )
        .map_err(query_failed)?;
    let category_str = category.map(|c| c.as_str().to_string());
    let rows = stmt
        .query_map((&student_id, &category_str), |r| {
            let id: String = r.get(0)?;
            let fee_id: String = r.get(1)?;
            let fee_type: String = r.get(2)?;
            let amount: f64 = r.get(3)?;
            let date: String = r.get(4)?;
            let recorded_by: String = r.get(5)?;
            let timestamp: String = r.get(6)?;
            Ok(json!({
                "id": id,
                "feeId": fee_id,
                "feeType": fee_type,
                "amount": amount,
                "date": date,
                "recordedBy": recorded_by,
                "timestamp": timestamp
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "transactions": rows }))
}

fn fees_dashboard(
    conn: &Connection,
    session: &StaffSession,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_optional_str(params, "classId")?;
    let mut department_id = get_optional_str(params, "departmentId")?;
    // Deans see their own department regardless of the requested filter.
    if session.role == crate::session::Role::Dean {
        if let Some(dep) = &session.department_id {
            department_id = Some(dep.clone());
        }
    }
    if let Some(dep) = &department_id {
        if !row_exists(conn, "SELECT 1 FROM departments WHERE id = ?", [dep])? {
            return Err(not_found("department not found"));
        }
    }
    if let Some(class) = &class_id {
        if !row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", [class])? {
            return Err(not_found("class not found"));
        }
    }

    let mut stmt = conn
        .prepare(
            "SELECT COALESCE(f.total_amount, 0),
                    COALESCE(f.total_paid, 0),
                    COALESCE(f.total_balance, 0)
             FROM students s
             JOIN classes c ON c.id = s.class_id
             LEFT JOIN fees f ON f.student_id = s.id
             WHERE (?1 IS NULL OR s.class_id = ?1)
               AND (?2 IS NULL OR c.department_id = ?2)",
        )
        .map_err(query_failed)?;
    let profiles: Vec<LedgerTotals> = stmt
        .query_map((&class_id, &department_id), |r| {
            Ok(LedgerTotals {
                total_amount: r.get(0)?,
                total_paid: r.get(1)?,
                total_balance: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let summary = ledger::summarize(profiles);
    Ok(json!({
        "classId": class_id,
        "departmentId": department_id,
        "summary": summary
    }))
}

fn dispatch(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let session = require_session(state)?;
    match req.method.as_str() {
        "fees.upsert" => {
            if !session.role.can_edit_fees() {
                return Err(forbidden("edit fees"));
            }
            fees_upsert(conn, session, &req.params)
        }
        "fees.recordPayment" => {
            if !session.role.can_edit_fees() {
                return Err(forbidden("record payments"));
            }
            fees_record_payment(conn, session, &req.params)
        }
        "fees.open" => fees_open(conn, &req.params),
        "fees.list" => fees_list(conn, &req.params),
        "fees.transactions" => fees_transactions(conn, &req.params),
        "fees.dashboard" => fees_dashboard(conn, session, &req.params),
        other => Err(HandlerErr::new(
            "not_implemented",
            format!("unknown method: {}", other),
        )),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "fees.upsert"
        | "fees.recordPayment"
        | "fees.open"
        | "fees.list"
        | "fees.transactions"
        | "fees.dashboard" => Some(match dispatch(state, req) {
            Ok(result) => ok(&req.id, result),
            Err(error) => error.response(&req.id),
        }),
        _ => None,
    }
}
