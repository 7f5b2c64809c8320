use anyhow::Result;
use tracing::{error, info};

use crate::store::{Dao, Period, Ranking};
use crate::util::time::now_unix;

const HOUR_SECS: i64 = 3600;
const DAY_SECS: i64 = 24 * HOUR_SECS;
const WEEK_SECS: i64 = 7 * DAY_SECS;

/// Recomputes the period popularity orderings from stored stories.
pub struct Ranker {
    dao: Dao,
}

impl Ranker {
    #[must_use]
    pub fn new(dao: Dao) -> Self {
        Self { dao }
    }

    /// Recompute all three period windows against one wall-clock "now".
    ///
    /// Each period is independent: a failure is logged and scoped to that
    /// period, the others still complete.
    pub async fn compute_all(&self) {
        let now = now_unix();

        let windows = [
            (Period::Day, now - DAY_SECS, now, false),
            // Yesterday is a fixed historical snapshot: raw scores, no decay.
            (Period::Yesterday, now - 2 * DAY_SECS, now - DAY_SECS, true),
            (Period::Week, now - WEEK_SECS, now, false),
        ];

        for (period, from, to, use_raw) in windows {
            match self.compute_period(period, from, to, now, use_raw).await {
                Ok(count) => info!(period = period.as_str(), count, "computed rankings"),
                Err(e) => {
                    error!(period = period.as_str(), error = %format!("{e:#}"), "ranking computation failed");
                }
            }
        }
    }

    async fn compute_period(
        &self,
        period: Period,
        from: i64,
        to: i64,
        now: i64,
        use_raw: bool,
    ) -> Result<usize> {
        let stories = self.dao.list_by_time_range(from, to).await?;

        let rows: Vec<Ranking> = stories
            .iter()
            .map(|story| {
                let score = if use_raw {
                    story.score as f64
                } else {
                    let age_hours = (now - story.time) as f64 / HOUR_SECS as f64;
                    decay_score(story.score, age_hours)
                };
                Ranking {
                    story_id: story.id,
                    period,
                    score,
                    computed_at: now,
                }
            })
            .collect();

        self.dao.replace_rankings(period, &rows).await?;
        Ok(rows.len())
    }
}

/// Gravity-style decay favoring recency. `age_hours + 2` is always ≥ 2, so
/// there is no division by zero; a raw score of 0 or 1 yields a non-positive
/// numerator and that is kept as-is; only the relative order matters.
pub(crate) fn decay_score(raw: i64, age_hours: f64) -> f64 {
    (raw - 1) as f64 / (age_hours + 2.0).powf(1.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Story;

    fn story(id: i64, time: i64, score: i64) -> Story {
        Story {
            id,
            title: format!("story {id}"),
            url: None,
            text: None,
            score,
            by: "tester".to_string(),
            time,
            descendants: 0,
            kind: "story".to_string(),
            fetched_at: time,
            rank: None,
            dead: false,
        }
    }

    #[test]
    fn decay_matches_reference_values() {
        // 99 / 2^1.5 ≈ 35.0 at zero age.
        assert!((decay_score(100, 0.0) - 35.0).abs() < 0.01);
        // 99 / 24^1.5 ≈ 0.842 at 22 hours.
        assert!((decay_score(100, 22.0) - 0.842).abs() < 0.001);
    }

    #[test]
    fn decay_is_strictly_decreasing_in_age() {
        let mut previous = f64::INFINITY;
        for age in 0..48 {
            let score = decay_score(100, f64::from(age));
            assert!(score < previous, "score must decay at age {age}");
            previous = score;
        }
    }

    #[test]
    fn low_raw_scores_stay_unclamped() {
        assert!(decay_score(1, 5.0) == 0.0);
        assert!(decay_score(0, 5.0) < 0.0);
    }

    #[tokio::test]
    async fn compute_all_partitions_stories_into_windows() {
        let dao = Dao::open_in_memory().await.expect("store opens");
        let now = now_unix();

        // 1 hour old: day + week.
        dao.upsert_story(&story(1, now - HOUR_SECS, 100))
            .await
            .expect("fresh story");
        // 30 hours old: yesterday + week.
        dao.upsert_story(&story(2, now - 30 * HOUR_SECS, 80))
            .await
            .expect("yesterday story");
        // 6 days old: week only.
        dao.upsert_story(&story(3, now - 6 * DAY_SECS, 60))
            .await
            .expect("old story");
        // 30 days old: no window.
        dao.upsert_story(&story(4, now - 30 * DAY_SECS, 500))
            .await
            .expect("ancient story");

        let ranker = Ranker::new(dao.clone());
        ranker.compute_all().await;

        let (day, day_total) = dao.stories_by_period(Period::Day, 1).await.expect("day");
        assert_eq!(day_total, 1);
        assert_eq!(day[0].id, 1);

        let (yesterday, _) = dao
            .stories_by_period(Period::Yesterday, 1)
            .await
            .expect("yesterday");
        assert_eq!(yesterday.iter().map(|s| s.id).collect::<Vec<_>>(), [2]);

        let (_, week_total) = dao.stories_by_period(Period::Week, 1).await.expect("week");
        assert_eq!(week_total, 3);
    }

    #[tokio::test]
    async fn yesterday_scores_are_raw() {
        let dao = Dao::open_in_memory().await.expect("store opens");
        let now = now_unix();
        dao.upsert_story(&story(1, now - 30 * HOUR_SECS, 3))
            .await
            .expect("low score");
        dao.upsert_story(&story(2, now - 40 * HOUR_SECS, 80))
            .await
            .expect("high score");

        let ranker = Ranker::new(dao.clone());
        ranker.compute_all().await;

        // Raw ordering: the much older story wins on points alone, which a
        // decayed ordering would likely invert.
        let (stories, _) = dao
            .stories_by_period(Period::Yesterday, 1)
            .await
            .expect("yesterday");
        assert_eq!(stories.iter().map(|s| s.id).collect::<Vec<_>>(), [2, 1]);
    }
}
