//! LIMIT injection/clamping for a single top-level `SELECT`.

use crate::error::{CheckError, CheckResult};

fn limit_node(limit: i64) -> pg_query::protobuf::Node {
    use pg_query::protobuf::a_const;
    use pg_query::protobuf::node::Node as NodeEnum;
    use pg_query::protobuf::{AConst, Integer, Node};

    Node {
        node: Some(NodeEnum::AConst(AConst {
            isnull: false,
            location: -1,
            val: Some(a_const::Val::Ival(Integer { ival: limit as i32 })),
        })),
    }
}

/// Ensure the top-level `SELECT` in `sql` carries a `LIMIT` no greater than
/// `max_rows`: injects `LIMIT max_rows` if absent, clamps an existing literal
/// limit to `min(existing, max_rows)`, and leaves a non-literal limit
/// expression (a bind parameter) untouched — those cannot be read back, and a
/// generated query should never produce one.
///
/// Returns the deparsed SQL unchanged if `sql` is not a single `SELECT`
/// statement (callers should already have rejected non-SELECT input).
pub fn enforce_select_limit(sql: &str, max_rows: i64) -> CheckResult<String> {
    if max_rows <= 0 {
        return Err(CheckError::validation("max_rows must be a positive integer"));
    }

    let mut parsed = pg_query::parse(sql)
        .map_err(|e| CheckError::validation(format!("pg_query parse failed: {e}")))?;

    if parsed.protobuf.stmts.len() != 1 {
        return Err(CheckError::validation(
            "LIMIT rewrite only supports single-statement SQL",
        ));
    }

    let Some(raw) = parsed.protobuf.stmts.first_mut() else {
        return Ok(sql.to_string());
    };
    let Some(stmt) = raw.stmt.as_deref_mut() else {
        return Ok(sql.to_string());
    };
    let Some(node) = stmt.node.as_mut() else {
        return Ok(sql.to_string());
    };

    match node {
        pg_query::NodeEnum::SelectStmt(select) => {
            let existing = existing_literal_limit(select);
            let rewrite = match existing {
                None if select.limit_count.is_none() => true,
                Some(n) if n > max_rows => true,
                _ => false,
            };

            if !rewrite {
                return pg_query::deparse(&parsed.protobuf)
                    .map_err(|e| CheckError::validation(format!("pg_query deparse failed: {e}")));
            }

            select.limit_count = Some(Box::new(limit_node(max_rows)));
            select.limit_option = pg_query::protobuf::LimitOption::Count as i32;

            pg_query::deparse(&parsed.protobuf)
                .map_err(|e| CheckError::validation(format!("pg_query deparse failed: {e}")))
        }
        _ => Ok(sql.to_string()),
    }
}

fn existing_literal_limit(select: &pg_query::protobuf::SelectStmt) -> Option<i64> {
    let node = select.limit_count.as_deref()?;
    match node.node.as_ref()? {
        pg_query::NodeEnum::AConst(c) => match c.val.as_ref()? {
            pg_query::protobuf::a_const::Val::Ival(i) => Some(i.ival as i64),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_missing_limit() {
        let out = enforce_select_limit("SELECT id FROM users", 100).unwrap();
        assert!(out.to_uppercase().contains("LIMIT 100"));
    }

    #[test]
    fn clamps_oversized_limit() {
        let out = enforce_select_limit("SELECT id FROM users LIMIT 500", 100).unwrap();
        assert!(out.to_uppercase().contains("LIMIT 100"));
    }

    #[test]
    fn leaves_smaller_limit_alone() {
        let out = enforce_select_limit("SELECT id FROM users LIMIT 10", 100).unwrap();
        assert!(out.to_uppercase().contains("LIMIT 10"));
        assert!(!out.to_uppercase().contains("LIMIT 100"));
    }

    #[test]
    fn rejects_multi_statement() {
        assert!(enforce_select_limit("SELECT 1; SELECT 2", 10).is_err());
    }
}
