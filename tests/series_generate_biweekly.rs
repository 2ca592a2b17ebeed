
use serde_json::json;
use test_support::{
    create_student, create_subject, request_err, request_ok, select_workspace, spawn_sidecar,
    temp_dir,
};

#[test]
fn biweekly_series_respects_end_date() {
    let workspace = temp_dir("tutorbook-series-biweekly");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let subject_id = create_subject(&mut stdin, &mut reader, "t1", "English");
    let student_id = create_student(&mut stdin, &mut reader, "t1", "Petya S.");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "lessons.create",
        json!({
            "teacherId": "t1",
            "subjectId": subject_id,
            "startAt": "2026-09-01T10:30:00",
            "durationMinutes": 45,
            "priceRub": 1000,
            "participants": [{ "studentId": student_id }],
            "recurrence": { "frequency": "biweekly", "endDate": "2026-10-15" }
        }),
    );
    // 09-01, 09-15, 09-29, 10-13; 10-27 would overshoot the end date.
    assert_eq!(created.get("occurrenceCount").and_then(|v| v.as_i64()), Some(4));
    let occurrences = created
        .get("occurrences")
        .and_then(|v| v.as_array())
        .expect("occurrences");
    let starts: Vec<&str> = occurrences
        .iter()
        .map(|o| o.get("startAt").and_then(|v| v.as_str()).expect("startAt"))
        .collect();
    assert_eq!(
        starts,
        vec![
            "2026-09-01T10:30:00",
            "2026-09-15T10:30:00",
            "2026-09-29T10:30:00",
            "2026-10-13T10:30:00",
        ]
    );
}

#[test]
fn invalid_recurrence_bounds_leave_no_partial_series() {
    let workspace = temp_dir("tutorbook-series-invalid");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let subject_id = create_subject(&mut stdin, &mut reader, "t1", "Biology");
    let student_id = create_student(&mut stdin, &mut reader, "t1", "Olya T.");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "lessons.create",
        json!({
            "teacherId": "t1",
            "subjectId": subject_id,
            "startAt": "2026-09-01T10:00:00",
            "durationMinutes": 60,
            "priceRub": 1000,
            "participants": [{ "studentId": student_id }],
            "recurrence": { "frequency": "weekly", "endDate": "2026-08-01" }
        }),
    );
    assert_eq!(code, "bad_params");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "lessons.create",
        json!({
            "teacherId": "t1",
            "subjectId": subject_id,
            "startAt": "2026-09-01T10:00:00",
            "durationMinutes": 60,
            "priceRub": 1000,
            "participants": [{ "studentId": student_id }],
            "recurrence": { "frequency": "weekly", "maxOccurrences": 0 }
        }),
    );
    assert_eq!(code, "bad_params");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "lessons.list",
        json!({ "teacherId": "t1" }),
    );
    assert_eq!(
        listed.get("lessons").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
}
