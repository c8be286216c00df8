//! Ranking engine: 1-based ranks for one (indicator, year) group.
//!
//! Highest score is rank 1. Tied scores share a rank. Under the competition
//! scheme the next distinct score takes its position (1, 1, 3, 4); under the
//! dense scheme it takes the next integer (1, 1, 2, 3). Absent scores sort
//! below every present score and, by default, share the worst rank.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::observation::Observation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankingScheme {
    #[default]
    Competition,
    Dense,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbsentScores {
    /// Absent scores are ranked after every present score.
    #[default]
    Worst,
    /// Absent scores get no rank at all.
    Unranked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RankingPolicy {
    #[serde(default)]
    pub scheme: RankingScheme,
    #[serde(default)]
    pub absent_scores: AbsentScores,
}

/// Which observation field is the ranking score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankKey {
    Value,
    Scaled,
}

impl RankKey {
    pub fn score(self, observation: &Observation) -> Option<f64> {
        match self {
            Self::Value => observation.value,
            Self::Scaled => observation.scaled,
        }
    }
}

fn by_score_desc(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.total_cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Assigns ranks to `items` in place through `set_rank`.
///
/// `tie_break` orders items with equal scores so that the walk, and therefore
/// the result, is deterministic regardless of input order.
pub fn assign_ranks<T>(
    items: &mut [T],
    policy: RankingPolicy,
    score: impl Fn(&T) -> Option<f64>,
    tie_break: impl Fn(&T, &T) -> Ordering,
    mut set_rank: impl FnMut(&mut T, Option<i32>),
) {
    let scores: Vec<Option<f64>> = items
        .iter()
        .map(|item| score(item).filter(|v| !v.is_nan()))
        .collect();
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| {
        by_score_desc(scores[a], scores[b]).then_with(|| tie_break(&items[a], &items[b]))
    });

    let mut previous: Option<(Option<f64>, i32)> = None;
    for (position, &idx) in order.iter().enumerate() {
        let current = scores[idx];
        if current.is_none() && policy.absent_scores == AbsentScores::Unranked {
            set_rank(&mut items[idx], None);
            continue;
        }
        let rank = match previous {
            Some((prev_score, prev_rank)) if prev_score == current => prev_rank,
            Some((_, prev_rank)) if policy.scheme == RankingScheme::Dense => prev_rank + 1,
            _ => position as i32 + 1,
        };
        set_rank(&mut items[idx], Some(rank));
        previous = Some((current, rank));
    }
}

/// Ranks one (indicator, year) group of observations, breaking ties by area.
pub fn rank_observations(observations: &mut [Observation], policy: RankingPolicy, key: RankKey) {
    assign_ranks(
        observations,
        policy,
        |o| key.score(o),
        |a, b| a.area_code.cmp(&b.area_code),
        |o, rank| o.rank = rank,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranks_of(scores: &[Option<f64>], policy: RankingPolicy) -> Vec<Option<i32>> {
        let mut items: Vec<(usize, Option<f64>, Option<i32>)> =
            scores.iter().enumerate().map(|(i, s)| (i, *s, None)).collect();
        assign_ranks(
            &mut items,
            policy,
            |item| item.1,
            |a, b| a.0.cmp(&b.0),
            |item, rank| item.2 = rank,
        );
        items.iter().map(|item| item.2).collect()
    }

    #[test]
    fn test_competition_ranking_leaves_gaps_after_ties() {
        let ranks = ranks_of(
            &[Some(10.0), Some(10.0), Some(8.0), Some(5.0)],
            RankingPolicy::default(),
        );
        assert_eq!(ranks, vec![Some(1), Some(1), Some(3), Some(4)]);
    }

    #[test]
    fn test_dense_ranking_collapses_after_ties() {
        let policy = RankingPolicy {
            scheme: RankingScheme::Dense,
            ..Default::default()
        };
        let ranks = ranks_of(&[Some(10.0), Some(10.0), Some(8.0), Some(5.0)], policy);
        assert_eq!(ranks, vec![Some(1), Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_absent_score_gets_worst_rank() {
        let ranks = ranks_of(&[Some(10.0), None, Some(5.0)], RankingPolicy::default());
        assert_eq!(ranks, vec![Some(1), Some(3), Some(2)]);
    }

    #[test]
    fn test_absent_scores_tie_at_the_bottom() {
        let ranks = ranks_of(&[None, Some(1.0), None], RankingPolicy::default());
        assert_eq!(ranks, vec![Some(2), Some(1), Some(2)]);
    }

    #[test]
    fn test_absent_scores_unranked() {
        let policy = RankingPolicy {
            absent_scores: AbsentScores::Unranked,
            ..Default::default()
        };
        let ranks = ranks_of(&[Some(10.0), None, Some(5.0)], policy);
        assert_eq!(ranks, vec![Some(1), None, Some(2)]);
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let a = ranks_of(&[Some(3.0), Some(1.0), Some(2.0)], RankingPolicy::default());
        assert_eq!(a, vec![Some(1), Some(3), Some(2)]);
        let b = ranks_of(&[Some(1.0), Some(2.0), Some(3.0)], RankingPolicy::default());
        assert_eq!(b, vec![Some(3), Some(2), Some(1)]);
    }

    #[test]
    fn test_rank_observations_by_scaled() {
        let mut obs = vec![
            Observation::new("ODB", "ITA", 2015, Some(90.0)),
            Observation::new("ODB", "FRA", 2015, Some(10.0)),
        ];
        obs[0].scaled = Some(0.2);
        obs[1].scaled = Some(0.8);
        rank_observations(&mut obs, RankingPolicy::default(), RankKey::Scaled);
        assert_eq!(obs[0].rank, Some(2));
        assert_eq!(obs[1].rank, Some(1));
    }

    #[test]
    fn test_empty_group() {
        assert!(ranks_of(&[], RankingPolicy::default()).is_empty());
    }
}
