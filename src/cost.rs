//! Query cost heuristics used to order Processing backfills.

use crate::collaborators::{CostAnalyzer, QueryObject};

const LITERAL_COST: f64 = 1.0;
const REGEXP_COST: f64 = 2.0;
const STRUCTURAL_COST: f64 = 5.0;

const DIFF_MULTIPLIER: f64 = 4.0;
const COMMIT_MULTIPLIER: f64 = 2.0;
const PER_TERM_MULTIPLIER: f64 = 0.1;

/// Default [`CostAnalyzer`]: scores the query by its pattern type and search
/// type, scaled by the number of repositories it runs over.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicCostAnalyzer;

impl HeuristicCostAnalyzer {
    fn query_complexity(query: &str) -> f64 {
        let mut base = LITERAL_COST;
        let mut multiplier = 1.0;
        let mut terms = 0usize;

        for token in query.split_whitespace() {
            match token.split_once(':') {
                Some(("patterntype" | "patternType", value)) => {
                    base = match value.to_ascii_lowercase().as_str() {
                        "regexp" | "regex" => REGEXP_COST,
                        "structural" => STRUCTURAL_COST,
                        _ => LITERAL_COST,
                    };
                }
                Some(("type", "diff")) => multiplier *= DIFF_MULTIPLIER,
                Some(("type", "commit")) => multiplier *= COMMIT_MULTIPLIER,
                Some((field, _)) if !field.is_empty() => {}
                _ => terms += 1,
            }
        }

        base * multiplier * (1.0 + PER_TERM_MULTIPLIER * terms.saturating_sub(1) as f64)
    }
}

impl CostAnalyzer for HeuristicCostAnalyzer {
    fn cost(&self, query: &QueryObject) -> anyhow::Result<f64> {
        if query.query.trim().is_empty() {
            anyhow::bail!("cannot estimate the cost of an empty query");
        }
        Ok(Self::query_complexity(&query.query) * query.repo_count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cost(query: &str, repo_count: usize) -> f64 {
        HeuristicCostAnalyzer
            .cost(&QueryObject {
                query: query.to_string(),
                repo_count,
            })
            .unwrap()
    }

    #[test]
    fn test_cost_scales_with_repo_count() {
        assert_eq!(cost("deprecated", 1), 1.0);
        assert_eq!(cost("deprecated", 40), 40.0);
        assert_eq!(cost("deprecated", 0), 0.0);
    }

    #[test]
    fn test_pattern_and_search_type_raise_cost() {
        let literal = cost("deprecated", 10);
        let regexp = cost("patterntype:regexp deprecated", 10);
        let structural = cost("patterntype:structural fmt.Println(...)", 10);
        let diff = cost("type:diff deprecated", 10);
        let commit = cost("type:commit deprecated", 10);

        assert!(regexp > literal);
        assert!(structural > regexp);
        assert!(diff > commit);
        assert!(commit > literal);
    }

    #[test]
    fn test_empty_query_is_rejected() {
        let result = HeuristicCostAnalyzer.cost(&QueryObject {
            query: "   ".to_string(),
            repo_count: 3,
        });
        assert!(result.is_err());
    }
}
