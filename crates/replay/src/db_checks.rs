//! Post-condition checks against the backing store

use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactWriter;
use crate::config::{DatabaseSettings, DbTarget};
use crate::context::{substitute_value, Context, ContextSource};
use crate::database::{to_positional, Database, DbConnector, DbRow};
use crate::error::{ReplayError, ReplayResult};
use crate::spec::{DbCheck, Spec};

/// Run every `db_checks` entry of `spec` over one connection.
///
/// Each check is retried up to its attempt budget at a fixed interval. The
/// context is rebuilt for every attempt so anchors captured late still
/// reach the query.
pub async fn run_db_checks(
    spec: &Spec,
    source: &ContextSource,
    connector: &dyn DbConnector,
    settings: &DatabaseSettings,
    artifacts: &ArtifactWriter,
) -> ReplayResult<()> {
    if spec.db_checks.is_empty() {
        return Ok(());
    }

    let target = DbTarget::resolve(&source.snapshot(), settings)?;
    let mut db = connector.connect(&target).await?;

    let mut outcome = Ok(());
    for check in &spec.db_checks {
        if let Err(message) = run_check(db.as_mut(), check, source).await {
            artifacts.write_json(
                "db-check-failed",
                &json!({
                    "message": message,
                    "check": {
                        "name": check.name,
                        "dms": check.dms,
                        "sql": check.sql,
                        "params": check.params,
                        "assert": check.assertions,
                    },
                    "mysql": {
                        "host": target.host,
                        "port": target.port,
                        "database": target.database,
                        "user": target.user,
                    },
                    "anchors": source.anchors().snapshot(),
                    "env": source.env(),
                }),
            );
            outcome = Err(ReplayError::Assertion(format!(
                "DB check failed: {} - {} (mysql={})",
                check.name,
                message,
                target.describe()
            )));
            break;
        }
        info!(check = %check.name, "db check passed");
    }

    if let Err(e) = db.close().await {
        warn!("closing mysql connection failed: {}", e);
    }
    outcome
}

/// Returns the last attempt's failure message once attempts are exhausted.
async fn run_check(
    db: &mut dyn Database,
    check: &DbCheck,
    source: &ContextSource,
) -> Result<(), String> {
    let attempts = check.attempts();
    let interval = Duration::from_millis(check.interval_ms());

    let mut last_error = String::new();
    for attempt in 1..=attempts {
        let ctx = source.snapshot();
        match attempt_check(db, check, &ctx).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!(check = %check.name, attempt, attempts, "db check attempt failed: {}", e);
                last_error = e;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(last_error)
}

async fn attempt_check(
    db: &mut dyn Database,
    check: &DbCheck,
    ctx: &Context,
) -> Result<(), String> {
    let query = to_positional(&check.sql, &check.params, ctx).map_err(|e| e.to_string())?;
    let rows = db
        .query(&query.sql, &query.values)
        .await
        .map_err(|e| e.to_string())?;
    let row = rows.first().ok_or_else(|| "no rows returned".to_string())?;
    evaluate_assertions(row, check, ctx)
}

/// Evaluate `assert` against one row. `not_null` and `not_empty` are
/// predicates, anything else is an exact text comparison.
pub fn evaluate_assertions(row: &DbRow, check: &DbCheck, ctx: &Context) -> Result<(), String> {
    for (field, raw) in &check.assertions {
        let expected = substitute_value(raw, ctx);
        let actual = row.get(field).and_then(Option::as_deref);
        match expected.as_str() {
            "not_null" => {
                if actual.is_none() {
                    return Err(format!("field {} expected=not_null but was null", field));
                }
            }
            "not_empty" => {
                if actual.map(str::trim).unwrap_or("").is_empty() {
                    return Err(format!("field {} expected=not_empty but was empty", field));
                }
            }
            _ => {
                let actual_text = match row.get(field) {
                    Some(Some(v)) => v.as_str(),
                    Some(None) => "null",
                    None => "undefined",
                };
                if actual_text != expected {
                    return Err(format!(
                        "field {} expected={} actual={}",
                        field, expected, actual_text
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use test_case::test_case;

    fn check(assertions: Value) -> DbCheck {
        serde_json::from_value(json!({"name": "c", "sql": "select 1", "assert": assertions}))
            .unwrap()
    }

    fn row(pairs: &[(&str, Option<&str>)]) -> DbRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect::<BTreeMap<_, _>>()
    }

    #[test_case(Some("x"), true ; "value present")]
    #[test_case(Some(""), true ; "empty string is not null")]
    #[test_case(None, false ; "sql null")]
    fn test_not_null(value: Option<&str>, passes: bool) {
        let c = check(json!({"f": "not_null"}));
        let result = evaluate_assertions(&row(&[("f", value)]), &c, &Context::default());
        assert_eq!(result.is_ok(), passes);
        if let Err(message) = result {
            assert_eq!(message, "field f expected=not_null but was null");
        }
    }

    #[test_case(Some("x"), true ; "value present")]
    #[test_case(Some("   "), false ; "blank")]
    #[test_case(Some(""), false ; "empty")]
    #[test_case(None, false ; "sql null")]
    fn test_not_empty(value: Option<&str>, passes: bool) {
        let c = check(json!({"f": "not_empty"}));
        let result = evaluate_assertions(&row(&[("f", value)]), &c, &Context::default());
        assert_eq!(result.is_ok(), passes);
    }

    #[test]
    fn test_equality_is_substituted() {
        let ctx = Context::from_pairs([("order_id", "42")]);
        let c = check(json!({"id": "${order_id}", "qty": 2}));

        let matching = row(&[("id", Some("42")), ("qty", Some("2"))]);
        assert!(evaluate_assertions(&matching, &c, &ctx).is_ok());

        let other = row(&[("id", Some("41")), ("qty", Some("2"))]);
        let err = evaluate_assertions(&other, &c, &ctx).unwrap_err();
        assert_eq!(err, "field id expected=42 actual=41");
    }

    #[test]
    fn test_missing_column_fails_equality() {
        let c = check(json!({"status": "PAID"}));
        let err = evaluate_assertions(&row(&[]), &c, &Context::default()).unwrap_err();
        assert_eq!(err, "field status expected=PAID actual=undefined");
    }
}
