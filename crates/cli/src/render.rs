//! Plain-text views for the operator CLI.

use std::fmt::Write as _;

use enrollsnap_core::{CatalogEntry, Snapshot};
use enrollsnap_diff::{ProviderLabel, SnapshotDiff};
use enrollsnap_infra::QuantumOutcome;

pub fn outcome(outcome: &QuantumOutcome) -> String {
    match outcome {
        QuantumOutcome::Idle => "No snapshot is being generated.".to_string(),
        QuantumOutcome::Skipped => "Snapshot is locked by a foreground run; skipped.".to_string(),
        QuantumOutcome::NoBudget => "Background budget is zero; nothing to do.".to_string(),
        QuantumOutcome::Suspended { completed_units } => {
            format!("Suspended after {completed_units} checks.")
        }
        QuantumOutcome::Finished(snapshot) => format!(
            "Finished snapshot {} ({})",
            snapshot.id(),
            if snapshot.is_valid() { "valid" } else { "error" }
        ),
    }
}

pub fn status(active: &Snapshot) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "{} ({})", active.friendly_name(), active.id());
    let _ = writeln!(text, "stage: {}", active.stage());
    let _ = writeln!(text, "progress: {}", active.progress_label());
    let _ = writeln!(
        text,
        "checks: {}/{}",
        active.completed_units(),
        active.total_units()
    );
    let _ = write!(text, "locked: {}", active.is_locked());
    text
}

pub fn catalog_line(entry: &CatalogEntry) -> String {
    let validity = if entry.is_valid { "valid" } else { "invalid" };
    format!("{}\t{validity}\t{}", entry.id, entry.descriptor)
}

pub fn snapshot(snapshot: &Snapshot) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "{}", snapshot.descriptor());
    let _ = writeln!(text, "id: {}", snapshot.id());
    let _ = writeln!(text, "stage: {}", snapshot.stage());
    if let Some(error) = snapshot.error() {
        let _ = writeln!(text, "error: {error}");
    }
    if let Some(end) = snapshot.end_time() {
        let _ = writeln!(text, "finished: {}", end.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    let _ = writeln!(
        text,
        "courses: {}, users: {}, checks: {}/{}",
        snapshot.total_courses(),
        snapshot.total_users(),
        snapshot.completed_units(),
        snapshot.total_units()
    );
    for (course_id, users) in snapshot.results() {
        let ids: Vec<String> = users.iter().map(ToString::to_string).collect();
        let _ = writeln!(text, "  course {course_id}: [{}]", ids.join(", "));
    }
    text.trim_end().to_string()
}

pub fn diff(diff: &SnapshotDiff) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "A: {} [{}]", diff.a.descriptor, diff.a.id);
    let _ = writeln!(text, "B: {} [{}]", diff.b.descriptor, diff.b.id);

    for message in diff.notices.messages() {
        let _ = writeln!(text, "warning: {message}");
    }

    let totals = &diff.totals;
    let _ = writeln!(
        text,
        "{} of {} courses differ ({} user enrollments)",
        totals.courses_differing, totals.courses_compared, totals.users_differing
    );

    for course in &diff.courses {
        let _ = writeln!(
            text,
            "\n{} (#{}): {} difference(s)",
            course.label, course.course_id, course.diff_count
        );
        for user in &course.users {
            let marker = if user.same { " " } else { "*" };
            let _ = writeln!(
                text,
                "  {marker} {} (#{})  A: {}  B: {}",
                user.label,
                user.user_id,
                enrollment(user.enrolled_a, &user.providers_a),
                enrollment(user.enrolled_b, &user.providers_b),
            );
        }
    }
    text
}

fn enrollment(enrolled: bool, providers: &[ProviderLabel]) -> String {
    if !enrolled {
        return "no".to_string();
    }
    if providers.is_empty() {
        return "yes".to_string();
    }
    let labels: Vec<&str> = providers.iter().map(|p| p.label.as_str()).collect();
    format!("yes [{}]", labels.join(", "))
}
