use std::collections::hash_map::Entry;
use std::collections::HashMap;

use rusqlite::Connection;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct RankError {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl RankError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        RankError {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// One student's mark within a single subject batch, after identity
/// resolution. Entries keep their submission order; that order is the
/// tie-break for equal scores.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreEntry {
    pub student_id: String,
    pub name: String,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedScore {
    pub student_id: String,
    pub name: String,
    pub score: i64,
    pub position: i64,
}

/// One persisted score row as read back for the totals pass. The subject
/// dimension is deliberately absent: totals sum a student's scores across
/// every subject they appear in.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRow {
    pub student_id: String,
    pub name: String,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentTotal {
    pub name: String,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedTotal {
    pub student_id: String,
    pub name: String,
    pub total: i64,
    pub position: i64,
}

/// Sorts descending by score and assigns 1-based positions. The sort is
/// stable, so students with equal scores keep their submission order.
pub fn assign_subject_positions(entries: &[ScoreEntry]) -> Vec<RankedScore> {
    let mut sorted: Vec<&ScoreEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| b.score.cmp(&a.score));
    sorted
        .iter()
        .enumerate()
        .map(|(i, e)| RankedScore {
            student_id: e.student_id.clone(),
            name: e.name.clone(),
            score: e.score,
            position: (i as i64) + 1,
        })
        .collect()
}

/// Sums scores per student id. Input order does not matter; the display name
/// rides along with the running total. Accumulation is overflow-checked:
/// a sum that leaves i64 is reported, never wrapped into a bogus ranking.
pub fn aggregate_totals(rows: &[ScoreRow]) -> Result<HashMap<String, StudentTotal>, RankError> {
    let mut totals: HashMap<String, StudentTotal> = HashMap::new();
    for row in rows {
        match totals.entry(row.student_id.clone()) {
            Entry::Occupied(mut e) => {
                let t = e.get_mut();
                t.total = t.total.checked_add(row.score).ok_or_else(|| {
                    RankError::new(
                        "score_overflow",
                        format!("total score for {} overflows", row.name),
                    )
                })?;
            }
            Entry::Vacant(e) => {
                e.insert(StudentTotal {
                    name: row.name.clone(),
                    total: row.score,
                });
            }
        }
    }
    Ok(totals)
}

/// Orders totals descending and assigns contiguous 1-based positions. Equal
/// totals fall back to name, then student id, so the outcome never depends
/// on map iteration order.
pub fn rank_totals(totals: HashMap<String, StudentTotal>) -> Vec<RankedTotal> {
    let mut out: Vec<RankedTotal> = totals
        .into_iter()
        .map(|(student_id, t)| RankedTotal {
            student_id,
            name: t.name,
            total: t.total,
            position: 0,
        })
        .collect();
    out.sort_by(|a, b| {
        b.total
            .cmp(&a.total)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.student_id.cmp(&b.student_id))
    });
    for (i, row) in out.iter_mut().enumerate() {
        row.position = (i as i64) + 1;
    }
    out
}

/// Reads every stored score and ranks the cross-subject totals. Read-only;
/// callers persist the result with `db::upsert_total_scores` when they want
/// the standings table refreshed.
pub fn compute_overall_standings(conn: &Connection) -> Result<Vec<RankedTotal>, RankError> {
    let mut stmt = conn
        .prepare(
            "SELECT sc.student_id, st.name, sc.score
             FROM subject_scores sc
             JOIN students st ON st.id = sc.student_id",
        )
        .map_err(|e| RankError::new("db_query_failed", e.to_string()))?;

    let rows = stmt
        .query_map([], |r| {
            Ok(ScoreRow {
                student_id: r.get(0)?,
                name: r.get(1)?,
                score: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| RankError::new("db_query_failed", e.to_string()))?;

    Ok(rank_totals(aggregate_totals(&rows)?))
}

/// Canonical display form for a student name: surrounding whitespace
/// trimmed, internal runs collapsed to one space, each word title-cased.
/// Applied at ingestion and at lookup so "alice smith", "ALICE  SMITH" and
/// " Alice Smith " all meet.
pub fn canonical_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, word) in raw.split_whitespace().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.extend(chars.flat_map(char::to_lowercase));
        }
    }
    out
}

/// Canonical matching key for a subject: trimmed and lowercased. Display
/// spelling is stored separately, taken from the first upload.
pub fn subject_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, name: &str, score: i64) -> ScoreEntry {
        ScoreEntry {
            student_id: id.to_string(),
            name: name.to_string(),
            score,
        }
    }

    fn row(id: &str, name: &str, score: i64) -> ScoreRow {
        ScoreRow {
            student_id: id.to_string(),
            name: name.to_string(),
            score,
        }
    }

    #[test]
    fn subject_positions_are_descending_and_contiguous() {
        let ranked = assign_subject_positions(&[
            entry("a", "Alice", 90),
            entry("b", "Bob", 95),
            entry("c", "Cara", 40),
        ]);
        let order: Vec<(&str, i64)> = ranked
            .iter()
            .map(|r| (r.name.as_str(), r.position))
            .collect();
        assert_eq!(order, vec![("Bob", 1), ("Alice", 2), ("Cara", 3)]);
    }

    #[test]
    fn equal_scores_keep_submission_order() {
        let ranked = assign_subject_positions(&[
            entry("d", "Dana", 80),
            entry("c", "Cara", 90),
            entry("b", "Beth", 80),
        ]);
        let order: Vec<(&str, i64)> = ranked
            .iter()
            .map(|r| (r.name.as_str(), r.position))
            .collect();
        // Dana was submitted before Beth, so she outranks her at 80.
        assert_eq!(order, vec![("Cara", 1), ("Dana", 2), ("Beth", 3)]);
    }

    #[test]
    fn empty_batch_ranks_to_nothing() {
        assert!(assign_subject_positions(&[]).is_empty());
    }

    #[test]
    fn totals_sum_across_subjects_per_student() {
        let totals = aggregate_totals(&[
            row("a", "Alice", 90),
            row("b", "Bob", 95),
            row("a", "Alice", 70),
            row("b", "Bob", 60),
        ])
        .expect("totals");
        assert_eq!(totals.len(), 2);
        assert_eq!(totals["a"].total, 160);
        assert_eq!(totals["b"].total, 155);
        assert_eq!(totals["a"].name, "Alice");
    }

    #[test]
    fn totals_are_order_independent() {
        let forward = aggregate_totals(&[
            row("a", "Alice", 90),
            row("b", "Bob", 95),
            row("a", "Alice", 70),
        ])
        .expect("totals");
        let backward = aggregate_totals(&[
            row("a", "Alice", 70),
            row("b", "Bob", 95),
            row("a", "Alice", 90),
        ])
        .expect("totals");
        assert_eq!(forward, backward);
    }

    #[test]
    fn totals_report_overflow_instead_of_wrapping() {
        let err = aggregate_totals(&[row("a", "Alice", i64::MAX), row("a", "Alice", 1)])
            .expect_err("overflowing sum must be reported");
        assert_eq!(err.code, "score_overflow");
    }

    #[test]
    fn overall_ranking_matches_two_subject_walkthrough() {
        // Math: bob 95, alice 90. Science: alice 70, bob 60.
        let totals = aggregate_totals(&[
            row("alice", "Alice", 90),
            row("bob", "Bob", 95),
            row("alice", "Alice", 70),
            row("bob", "Bob", 60),
        ])
        .expect("totals");
        let ranked = rank_totals(totals);
        let order: Vec<(&str, i64, i64)> = ranked
            .iter()
            .map(|r| (r.name.as_str(), r.total, r.position))
            .collect();
        assert_eq!(order, vec![("Alice", 160, 1), ("Bob", 155, 2)]);
    }

    #[test]
    fn equal_totals_rank_by_name_then_id() {
        let mut totals = HashMap::new();
        totals.insert(
            "z1".to_string(),
            StudentTotal {
                name: "Zoe".to_string(),
                total: 50,
            },
        );
        totals.insert(
            "a1".to_string(),
            StudentTotal {
                name: "Amy".to_string(),
                total: 50,
            },
        );
        totals.insert(
            "a0".to_string(),
            StudentTotal {
                name: "Amy".to_string(),
                total: 50,
            },
        );
        let ranked = rank_totals(totals);
        let order: Vec<(&str, &str, i64)> = ranked
            .iter()
            .map(|r| (r.name.as_str(), r.student_id.as_str(), r.position))
            .collect();
        assert_eq!(
            order,
            vec![("Amy", "a0", 1), ("Amy", "a1", 2), ("Zoe", "z1", 3)]
        );
    }

    #[test]
    fn ranked_positions_are_always_contiguous() {
        let totals = aggregate_totals(&[
            row("a", "Alice", 10),
            row("b", "Bob", 10),
            row("c", "Cara", 10),
            row("d", "Dan", 3),
        ])
        .expect("totals");
        let ranked = rank_totals(totals);
        let positions: Vec<i64> = ranked.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![1, 2, 3, 4]);
        for pair in ranked.windows(2) {
            assert!(pair[0].total >= pair[1].total);
        }
    }

    #[test]
    fn names_are_canonicalised_to_title_case() {
        assert_eq!(canonical_name("alice smith"), "Alice Smith");
        assert_eq!(canonical_name("  ALICE   SMITH "), "Alice Smith");
        assert_eq!(canonical_name("o'neil"), "O'neil");
        assert_eq!(canonical_name(""), "");
        assert_eq!(canonical_name("   "), "");
    }

    #[test]
    fn subject_keys_fold_case_and_whitespace() {
        assert_eq!(subject_key(" Math "), "math");
        assert_eq!(subject_key("SCIENCE"), "science");
        assert_eq!(subject_key("further maths"), "further maths");
    }
}
