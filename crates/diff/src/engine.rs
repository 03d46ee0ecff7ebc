use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use enrollsnap_core::{CourseId, EntityResolver, ProviderId, Snapshot, UserId};

use crate::model::{
    CourseDiff, DiffNotices, DiffOptions, DiffTotals, ProviderLabel, SideSummary, SnapshotDiff,
    UserDiff,
};

/// Compare the enrollment results of `a` and `b`.
///
/// - Courses: union of both result maps, ascending.
/// - Users per course: union of the users enrolled in that course on either side.
/// - Unresolvable courses and users stay in the matrix as `"Unknown {id}"`
///   and are reported once in [`DiffNotices`].
///
/// Never fails; missing entities only degrade labels.
pub fn diff(a: &Snapshot, b: &Snapshot, resolver: &dyn EntityResolver, options: DiffOptions) -> SnapshotDiff {
    let course_ids: BTreeSet<CourseId> = a.results().keys().chain(b.results().keys()).copied().collect();

    let user_names: BTreeMap<UserId, Option<String>> = a
        .results()
        .values()
        .chain(b.results().values())
        .flatten()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|user_id| (user_id, resolver.user_display_name(user_id)))
        .collect();

    let mut notices = DiffNotices {
        missing_users: user_names
            .iter()
            .filter(|(_, name)| name.is_none())
            .map(|(id, _)| *id)
            .collect(),
        ..DiffNotices::default()
    };

    let mut totals = DiffTotals::default();
    let mut courses = Vec::new();

    for course_id in course_ids {
        let title = resolver.course_title(course_id);
        if title.is_none() {
            notices.missing_courses.push(course_id);
        }

        let course = course_diff(course_id, title, a, b, &user_names, resolver);
        totals.courses_compared += 1;
        totals.users_differing += course.diff_count;
        if course.differs {
            totals.courses_differing += 1;
        }

        if options.diff_only && !course.differs {
            totals.courses_hidden += 1;
            continue;
        }
        courses.push(course);
    }

    debug!(
        a = %a.id(),
        b = %b.id(),
        courses_compared = totals.courses_compared,
        courses_differing = totals.courses_differing,
        missing_courses = notices.missing_courses.len(),
        missing_users = notices.missing_users.len(),
        "snapshots compared"
    );

    SnapshotDiff {
        a: SideSummary::from(a),
        b: SideSummary::from(b),
        courses,
        notices,
        totals,
    }
}

fn course_diff(
    course_id: CourseId,
    title: Option<String>,
    a: &Snapshot,
    b: &Snapshot,
    user_names: &BTreeMap<UserId, Option<String>>,
    resolver: &dyn EntityResolver,
) -> CourseDiff {
    let enrolled = |s: &Snapshot| s.results().get(&course_id).cloned().unwrap_or_default();
    let (in_a, in_b) = (enrolled(a), enrolled(b));

    let users: Vec<UserDiff> = in_a
        .union(&in_b)
        .map(|&user_id| {
            let name = user_names.get(&user_id).cloned().flatten();
            let enrolled_a = in_a.contains(&user_id);
            let enrolled_b = in_b.contains(&user_id);
            UserDiff {
                user_id,
                resolved: name.is_some(),
                label: name.unwrap_or_else(|| unknown(user_id)),
                enrolled_a,
                enrolled_b,
                same: enrolled_a == enrolled_b,
                providers_a: provider_labels(a.enrolling_providers(course_id, user_id), resolver),
                providers_b: provider_labels(b.enrolling_providers(course_id, user_id), resolver),
            }
        })
        .collect();

    let diff_count = users.iter().filter(|u| !u.same).count();
    CourseDiff {
        course_id,
        resolved: title.is_some(),
        label: title.unwrap_or_else(|| unknown(course_id)),
        differs: diff_count > 0,
        diff_count,
        users,
    }
}

fn provider_labels(providers: Option<&BTreeSet<ProviderId>>, resolver: &dyn EntityResolver) -> Vec<ProviderLabel> {
    providers
        .into_iter()
        .flatten()
        .map(|id| ProviderLabel {
            label: resolver.provider_label(id).unwrap_or_else(|| id.humanized()),
            id: id.clone(),
        })
        .collect()
}

fn unknown(id: impl std::fmt::Display) -> String {
    format!("Unknown {id}")
}
