//! Result Validator (C5): a heuristic confidence score over an NL-generated
//! query's result, used to decide whether to retry generation.

use crate::executor::QueryResult;

#[derive(Debug, Clone, PartialEq)]
pub struct ResultScore {
    /// 0-100.
    pub confidence: u8,
    pub acceptable: bool,
    pub reasons: Vec<String>,
}

/// Score how well `result` plausibly answers `prompt`, given the SQL that
/// produced it. Pure heuristic: no second LLM call, no I/O.
pub fn score(prompt: &str, sql: &str, result: &QueryResult, threshold: u8) -> ResultScore {
    let mut confidence: i32 = 100;
    let mut reasons = Vec::new();

    if result.rows.is_empty() {
        confidence -= 30;
        reasons.push("result set is empty".to_string());
    }

    if result.row_count_capped {
        confidence -= 10;
        reasons.push("result was capped by the row limit".to_string());
    }

    let lower_prompt = prompt.to_ascii_lowercase();
    let wants_count = lower_prompt.contains("how many") || lower_prompt.contains("count of");
    let sql_has_count = sql.to_ascii_lowercase().contains("count(");
    if wants_count && !sql_has_count {
        confidence -= 25;
        reasons.push("prompt asks for a count but the statement has no COUNT aggregate".to_string());
    }

    if let Some(n) = extract_requested_row_count(&lower_prompt) {
        if result.rows.len() as u64 > n && !result.row_count_capped {
            confidence -= 15;
            reasons.push(format!(
                "prompt requested at most {n} rows but {} were returned",
                result.rows.len()
            ));
        }
    }

    if wants_count && result.columns.len() > 1 {
        confidence -= 15;
        reasons.push("prompt asks for a count but more than one column was returned".to_string());
    } else if let Some(n) = estimate_requested_column_count(&lower_prompt) {
        if result.columns.len() < n {
            confidence -= 15;
            reasons.push(format!(
                "prompt names at least {n} attributes but only {} columns were returned",
                result.columns.len()
            ));
        }
    }

    let confidence = confidence.clamp(0, 100) as u8;
    ResultScore {
        confidence,
        acceptable: confidence >= threshold,
        reasons,
    }
}

/// Counts "and"/comma-joined attribute mentions after a listing verb (e.g.
/// "show me the name and email") as a lower bound on the number of columns a
/// plausible answer should have. Absent such a list, returns `None` rather
/// than guessing.
fn estimate_requested_column_count(lower_prompt: &str) -> Option<usize> {
    const LISTING_VERBS: [&str; 4] = ["show me", "show ", "list ", "give me"];
    let start = LISTING_VERBS.iter().find_map(|verb| lower_prompt.find(verb).map(|idx| idx + verb.len()))?;
    let clause = lower_prompt[start..].split(|c| c == '.' || c == '?').next().unwrap_or("");

    let joins = clause.matches(" and ").count() + clause.matches(", ").count();
    if joins == 0 {
        return None;
    }
    Some(joins + 1)
}

/// Looks for "last N" / "top N" / "N " patterns to sanity-check row counts
/// against an explicit ask, without attempting full NL understanding.
fn extract_requested_row_count(lower_prompt: &str) -> Option<u64> {
    for marker in ["last ", "top ", "first "] {
        if let Some(idx) = lower_prompt.find(marker) {
            let after = &lower_prompt[idx + marker.len()..];
            let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(n) = digits.parse() {
                return Some(n);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::QueryResult;

    fn result(rows: usize, capped: bool) -> QueryResult {
        QueryResult {
            columns: vec!["id".to_string()],
            rows: (0..rows).map(|_| vec![serde_json::Value::Null]).collect(),
            row_count_capped: capped,
            execution_time_ms: 5,
        }
    }

    #[test]
    fn empty_result_lowers_confidence() {
        let s = score("show me users", "SELECT 1", &result(0, false), 70);
        assert!(s.confidence < 100);
    }

    #[test]
    fn count_mismatch_is_flagged() {
        let s = score("how many users are there", "SELECT id FROM users", &result(5, false), 70);
        assert!(!s.reasons.is_empty());
    }

    #[test]
    fn plausible_result_is_acceptable() {
        let s = score("show me the last 5 users", "SELECT * FROM users ORDER BY created DESC LIMIT 5", &result(5, false), 70);
        assert!(s.acceptable);
    }

    fn result_with_columns(columns: &[&str]) -> QueryResult {
        QueryResult {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: vec![columns.iter().map(|_| serde_json::Value::Null).collect()],
            row_count_capped: false,
            execution_time_ms: 5,
        }
    }

    #[test]
    fn count_prompt_with_multiple_columns_is_flagged() {
        let s = score(
            "how many orders are there",
            "SELECT id, status FROM orders",
            &result_with_columns(&["id", "status"]),
            70,
        );
        assert!(s.reasons.iter().any(|r| r.contains("more than one column")));
    }

    #[test]
    fn multi_attribute_prompt_with_too_few_columns_is_flagged() {
        let s = score(
            "show me the name and email of every user",
            "SELECT name FROM users",
            &result_with_columns(&["name"]),
            70,
        );
        assert!(s.reasons.iter().any(|r| r.contains("only 1 columns were returned")));
    }

    #[test]
    fn multi_attribute_prompt_with_enough_columns_is_not_flagged() {
        let s = score(
            "show me the name and email of every user",
            "SELECT name, email FROM users",
            &result_with_columns(&["name", "email"]),
            70,
        );
        assert!(!s.reasons.iter().any(|r| r.contains("attributes")));
    }
}
