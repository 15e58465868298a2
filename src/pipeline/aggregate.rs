use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::domain::{
    ActivityRecord, AssessmentDefinition, CourseOffering, EnrollmentKey, RegistrationRecord,
    StudentFeatures, SubmissionRecord,
};
use crate::table::{mean, sample_std};

/// Per-enrollment rollup of clickstream behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityAggregate {
    pub key: EnrollmentKey,
    pub total_clicks: i64,
    pub avg_clicks_per_activity: f64,
    pub activity_count: i64,
    pub click_std: f64,
    pub first_day: i64,
    pub last_day: i64,
    pub active_days: i64,
    pub engagement_intensity: f64,
    pub days_without_activity: i64,
    pub late_start_days: i64,
    pub length_in_days: Option<i64>,
}

/// Per-enrollment rollup of assessment performance.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentAggregate {
    pub key: EnrollmentKey,
    pub mean_score: f64,
    pub score_std: f64,
    pub submission_count: i64,
    pub latest_score: f64,
}

/// Offering lookup keyed by (module, presentation).
pub type OfferingLengths = BTreeMap<(String, String), i64>;

pub fn offering_lengths(offerings: &[CourseOffering]) -> OfferingLengths {
    offerings
        .iter()
        .map(|o| {
            (
                (o.course_module.clone(), o.course_presentation.clone()),
                o.length_in_days,
            )
        })
        .collect()
}

/// Roll activity records up to one row per enrollment. Grouping is over a
/// BTreeMap so output order is deterministic regardless of input order.
pub fn aggregate_activity(
    records: &[ActivityRecord],
    lengths: &OfferingLengths,
) -> Vec<ActivityAggregate> {
    let mut groups: BTreeMap<EnrollmentKey, Vec<&ActivityRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.key.clone()).or_default().push(record);
    }

    let mut aggregates = Vec::with_capacity(groups.len());
    for (key, rows) in groups {
        let clicks: Vec<f64> = rows.iter().map(|r| r.clicks as f64).collect();
        let total_clicks: i64 = rows.iter().map(|r| r.clicks).sum();
        let activity_count = rows.len() as i64;
        let first_day = rows.iter().map(|r| r.day).min().unwrap_or(0);
        let last_day = rows.iter().map(|r| r.day).max().unwrap_or(0);

        let mut days: Vec<i64> = rows.iter().map(|r| r.day).collect();
        days.sort_unstable();
        days.dedup();
        let active_days = days.len() as i64;

        let length_in_days = lengths
            .get(&(key.course_module.clone(), key.course_presentation.clone()))
            .copied();

        aggregates.push(ActivityAggregate {
            key,
            total_clicks,
            avg_clicks_per_activity: mean(&clicks).unwrap_or(0.0),
            activity_count,
            click_std: sample_std(&clicks),
            first_day,
            last_day,
            active_days,
            engagement_intensity: total_clicks as f64 / active_days.max(1) as f64,
            days_without_activity: (last_day - first_day) - active_days,
            late_start_days: (first_day - 1).max(0),
            length_in_days,
        });
    }
    info!("Aggregated activity for {} enrollments", aggregates.len());
    aggregates
}

/// Roll submissions up to one row per enrollment. Submissions that carry no
/// module/presentation recover it from the assessment definition; rows that
/// still cannot be attributed to an offering are dropped.
pub fn aggregate_assessments(
    submissions: &[SubmissionRecord],
    definitions: &[AssessmentDefinition],
) -> Vec<AssessmentAggregate> {
    let defs: BTreeMap<i64, &AssessmentDefinition> =
        definitions.iter().map(|d| (d.assessment_id, d)).collect();

    let mut groups: BTreeMap<EnrollmentKey, Vec<&SubmissionRecord>> = BTreeMap::new();
    let mut dropped = 0usize;
    for submission in submissions {
        let def = defs.get(&submission.assessment_id);
        // The submission's own attribution wins; the definition only fills
        // gaps.
        let course_module = submission
            .course_module
            .clone()
            .or_else(|| def.map(|d| d.course_module.clone()));
        let course_presentation = submission
            .course_presentation
            .clone()
            .or_else(|| def.map(|d| d.course_presentation.clone()));
        let (Some(course_module), Some(course_presentation)) = (course_module, course_presentation)
        else {
            dropped += 1;
            continue;
        };
        groups
            .entry(EnrollmentKey {
                student_id: submission.student_id,
                course_module,
                course_presentation,
            })
            .or_default()
            .push(submission);
    }
    if dropped > 0 {
        warn!("Dropped {} submissions with no resolvable offering", dropped);
    }

    let mut aggregates = Vec::with_capacity(groups.len());
    for (key, rows) in groups {
        let scores: Vec<f64> = rows.iter().map(|r| r.score).collect();
        aggregates.push(AssessmentAggregate {
            key,
            mean_score: mean(&scores).unwrap_or(0.0),
            score_std: sample_std(&scores),
            submission_count: rows.len() as i64,
            // Input order stands in for submission time.
            latest_score: scores.last().copied().unwrap_or(0.0),
        });
    }
    info!("Aggregated assessments for {} enrollments", aggregates.len());
    aggregates
}

/// Join the two rollups plus registrations into the final feature rows.
/// Enrollments seen on either side survive; the missing side zero-fills.
pub fn build_profile(
    activity: &[ActivityAggregate],
    assessments: &[AssessmentAggregate],
    registrations: &[RegistrationRecord],
    lengths: &OfferingLengths,
) -> Vec<StudentFeatures> {
    let activity_by_key: BTreeMap<&EnrollmentKey, &ActivityAggregate> =
        activity.iter().map(|a| (&a.key, a)).collect();
    let assessments_by_key: BTreeMap<&EnrollmentKey, &AssessmentAggregate> =
        assessments.iter().map(|a| (&a.key, a)).collect();
    let registrations_by_key: BTreeMap<&EnrollmentKey, &RegistrationRecord> =
        registrations.iter().map(|r| (&r.key, r)).collect();

    let mut keys: Vec<&EnrollmentKey> = activity_by_key.keys().copied().collect();
    for key in assessments_by_key.keys() {
        if !activity_by_key.contains_key(*key) {
            keys.push(*key);
        }
    }
    keys.sort();

    let mut features = Vec::with_capacity(keys.len());
    for key in keys {
        let act = activity_by_key.get(key).copied();
        let assess = assessments_by_key.get(key).copied();
        let reg = registrations_by_key.get(key).copied();

        let length_in_days = act.and_then(|a| a.length_in_days).or_else(|| {
            lengths
                .get(&(key.course_module.clone(), key.course_presentation.clone()))
                .copied()
        });

        let registration_day = reg.and_then(|r| r.registration_day);
        let unregistration_day = reg.and_then(|r| r.unregistration_day);
        let study_duration = match (registration_day, unregistration_day) {
            (Some(reg_day), Some(unreg_day)) => Some(unreg_day - reg_day),
            _ => None,
        };
        let unregistered = unregistration_day.is_some();
        let dropout_risk_signal = unregistered || study_duration.map(|d| d < 0).unwrap_or(false);

        let active_days = act.map(|a| a.active_days).unwrap_or(0);
        let progress_rate = length_in_days.map(|len| active_days as f64 / len.max(1) as f64);

        features.push(StudentFeatures {
            key: (*key).clone(),
            total_clicks: act.map(|a| a.total_clicks).unwrap_or(0),
            avg_clicks_per_activity: act.map(|a| a.avg_clicks_per_activity).unwrap_or(0.0),
            activity_count: act.map(|a| a.activity_count).unwrap_or(0),
            click_std: act.map(|a| a.click_std).unwrap_or(0.0),
            first_activity_day: act.map(|a| a.first_day),
            last_activity_day: act.map(|a| a.last_day),
            active_days,
            engagement_intensity: act.map(|a| a.engagement_intensity).unwrap_or(0.0),
            days_without_activity: act.map(|a| a.days_without_activity).unwrap_or(0),
            late_start_days: act.map(|a| a.late_start_days).unwrap_or(0),
            length_in_days,
            mean_score: assess.map(|a| a.mean_score).unwrap_or(0.0),
            score_std: assess.map(|a| a.score_std).unwrap_or(0.0),
            submission_count: assess.map(|a| a.submission_count).unwrap_or(0),
            latest_score: assess.map(|a| a.latest_score).unwrap_or(0.0),
            registration_day,
            unregistration_day,
            study_duration,
            unregistered,
            progress_rate,
            dropout_risk_signal,
        });
    }
    info!("Built feature profile for {} enrollments", features.len());
    features
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(student_id: i64) -> EnrollmentKey {
        EnrollmentKey {
            student_id,
            course_module: "AAA".to_string(),
            course_presentation: "2024B".to_string(),
        }
    }

    fn activity(student_id: i64, site_id: i64, day: i64, clicks: i64) -> ActivityRecord {
        ActivityRecord {
            key: key(student_id),
            site_id,
            day,
            clicks,
        }
    }

    #[test]
    fn activity_rollup_counts_distinct_days() {
        let records = vec![
            activity(1, 10, 3, 4),
            activity(1, 11, 3, 6),
            activity(1, 12, 7, 2),
        ];
        let aggs = aggregate_activity(&records, &OfferingLengths::new());
        assert_eq!(aggs.len(), 1);
        let a = &aggs[0];
        assert_eq!(a.total_clicks, 12);
        assert_eq!(a.activity_count, 3);
        assert_eq!(a.active_days, 2);
        assert_eq!(a.first_day, 3);
        assert_eq!(a.last_day, 7);
        assert_eq!(a.engagement_intensity, 6.0);
        // Span of 4 days minus 2 active.
        assert_eq!(a.days_without_activity, 2);
        assert_eq!(a.late_start_days, 2);
        assert_eq!(a.length_in_days, None);
    }

    #[test]
    fn late_start_never_goes_negative() {
        let records = vec![activity(1, 10, -5, 1)];
        let aggs = aggregate_activity(&records, &OfferingLengths::new());
        assert_eq!(aggs[0].late_start_days, 0);
    }

    #[test]
    fn submissions_recover_offering_from_definition() {
        let submissions = vec![SubmissionRecord {
            assessment_id: 100,
            student_id: 1,
            course_module: None,
            course_presentation: None,
            score: 80.0,
            submitted_day: Some(20),
            banked: false,
        }];
        let definitions = vec![AssessmentDefinition {
            assessment_id: 100,
            course_module: "AAA".to_string(),
            course_presentation: "2024B".to_string(),
            weight: 10.0,
            due_day: Some(30),
        }];
        let aggs = aggregate_assessments(&submissions, &definitions);
        assert_eq!(aggs.len(), 1);
        assert_eq!(aggs[0].key, key(1));
        assert_eq!(aggs[0].mean_score, 80.0);
    }

    #[test]
    fn unresolvable_submissions_are_dropped() {
        let submissions = vec![SubmissionRecord {
            assessment_id: 999,
            student_id: 1,
            course_module: None,
            course_presentation: None,
            score: 80.0,
            submitted_day: None,
            banked: false,
        }];
        assert!(aggregate_assessments(&submissions, &[]).is_empty());
    }

    #[test]
    fn latest_score_follows_input_order() {
        let mk = |score: f64| SubmissionRecord {
            assessment_id: 100,
            student_id: 1,
            course_module: Some("AAA".to_string()),
            course_presentation: Some("2024B".to_string()),
            score,
            submitted_day: None,
            banked: false,
        };
        let aggs = aggregate_assessments(&[mk(60.0), mk(90.0)], &[]);
        assert_eq!(aggs[0].latest_score, 90.0);
        assert_eq!(aggs[0].submission_count, 2);
        assert_eq!(aggs[0].mean_score, 75.0);
    }

    #[test]
    fn profile_unions_enrollments_from_both_sides() {
        let activity_aggs = aggregate_activity(&[activity(1, 10, 2, 5)], &OfferingLengths::new());
        let assessment_aggs = aggregate_assessments(
            &[SubmissionRecord {
                assessment_id: 100,
                student_id: 2,
                course_module: Some("AAA".to_string()),
                course_presentation: Some("2024B".to_string()),
                score: 70.0,
                submitted_day: None,
                banked: false,
            }],
            &[],
        );
        let features = build_profile(&activity_aggs, &assessment_aggs, &[], &OfferingLengths::new());
        assert_eq!(features.len(), 2);

        let by_student: BTreeMap<i64, &StudentFeatures> =
            features.iter().map(|f| (f.key.student_id, f)).collect();
        // Activity-only row zero-fills the assessment side.
        assert_eq!(by_student[&1].mean_score, 0.0);
        assert_eq!(by_student[&1].submission_count, 0);
        // Assessment-only row zero-fills the activity side.
        assert_eq!(by_student[&2].total_clicks, 0);
        assert_eq!(by_student[&2].first_activity_day, None);
        assert_eq!(by_student[&2].mean_score, 70.0);
    }

    #[test]
    fn registration_join_derives_dropout_signal() {
        let activity_aggs = aggregate_activity(&[activity(1, 10, 2, 5)], &OfferingLengths::new());
        let registrations = vec![RegistrationRecord {
            key: key(1),
            registration_day: Some(-10),
            unregistration_day: Some(40),
        }];
        let features = build_profile(&activity_aggs, &[], &registrations, &OfferingLengths::new());
        let f = &features[0];
        assert_eq!(f.study_duration, Some(50));
        assert!(f.unregistered);
        assert!(f.dropout_risk_signal);
    }

    #[test]
    fn progress_rate_needs_a_known_length() {
        let mut lengths = OfferingLengths::new();
        lengths.insert(("AAA".to_string(), "2024B".to_string()), 100);
        let records = vec![activity(1, 10, 2, 5), activity(1, 11, 3, 5)];
        let aggs = aggregate_activity(&records, &lengths);
        let features = build_profile(&aggs, &[], &[], &lengths);
        assert_eq!(features[0].progress_rate, Some(0.02));

        let features = build_profile(
            &aggregate_activity(&records, &OfferingLengths::new()),
            &[],
            &[],
            &OfferingLengths::new(),
        );
        assert_eq!(features[0].progress_rate, None);
    }

    #[test]
    fn empty_inputs_give_empty_profile() {
        assert!(build_profile(&[], &[], &[], &OfferingLengths::new()).is_empty());
    }
}
