
use serde_json::json;
use test_support::{
    create_student, create_subject, request_err, request_ok, select_workspace, spawn_sidecar,
    temp_dir,
};

#[test]
fn duplicate_subject_names_and_codes_conflict() {
    let workspace = temp_dir("tutorbook-subjects-dup");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "subjects.create",
        json!({ "teacherId": "t1", "name": "Math", "code": "MATH-101" }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "teacherId": "t1", "name": "Math" }),
    );
    assert_eq!(code, "conflict");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "teacherId": "t1", "name": "Mathematics", "code": "MATH-101" }),
    );
    assert_eq!(code, "conflict");

    // Another teacher is free to reuse both.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.create",
        json!({ "teacherId": "t2", "name": "Math", "code": "MATH-101" }),
    );
}

#[test]
fn referenced_subjects_cannot_be_deleted() {
    let workspace = temp_dir("tutorbook-subjects-ref");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let subject_id = create_subject(&mut stdin, &mut reader, "t1", "Physics");
    let student_id = create_student(&mut stdin, &mut reader, "t1", "Learner");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "lessons.create",
        json!({
            "teacherId": "t1",
            "subjectId": subject_id,
            "startAt": "2026-09-01T10:00:00",
            "durationMinutes": 60,
            "priceRub": 1500,
            "participants": [{ "studentId": student_id }],
        }),
    );
    let lesson_id = created
        .pointer("/lesson/id")
        .and_then(|v| v.as_str())
        .expect("lesson id")
        .to_string();

    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.delete",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(code, "conflict");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "lessons.delete",
        json!({ "lessonId": lesson_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.delete",
        json!({ "subjectId": subject_id }),
    );
}

#[test]
fn unknown_references_are_not_found() {
    let workspace = temp_dir("tutorbook-not-found");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let student_id = create_student(&mut stdin, &mut reader, "t1", "Lonely");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "lessons.create",
        json!({
            "teacherId": "t1",
            "subjectId": "no-such-subject",
            "startAt": "2026-09-01T10:00:00",
            "durationMinutes": 60,
            "priceRub": 1500,
            "participants": [{ "studentId": student_id }],
        }),
    );
    assert_eq!(code, "not_found");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "lessons.open",
        json!({ "lessonId": "no-such-lesson" }),
    );
    assert_eq!(code, "not_found");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "subscriptions.consume",
        json!({ "subscriptionId": "no-such-subscription" }),
    );
    assert_eq!(code, "not_found");
}

#[test]
fn students_of_other_teachers_are_forbidden() {
    let workspace = temp_dir("tutorbook-forbidden");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let subject_id = create_subject(&mut stdin, &mut reader, "t1", "Math");
    // The student belongs to another teacher's roster.
    let outsider = create_student(&mut stdin, &mut reader, "t2", "Outsider");

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
            "priceRub": 1500,
            "participants": [{ "studentId": outsider }],
        }),
    );
    assert_eq!(code, "forbidden");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "subscriptions.create",
        json!({
            "teacherId": "t1",
            "studentId": outsider,
            "kind": "lessons",
            "name": "pack",
            "totalLessons": 5
        }),
    );
    assert_eq!(code, "forbidden");

    // Linking the student (the invitation flow's job) unlocks both.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.link",
        json!({ "teacherId": "t1", "studentId": outsider }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "lessons.create",
        json!({
            "teacherId": "t1",
            "subjectId": subject_id,
            "startAt": "2026-09-01T10:00:00",
            "durationMinutes": 60,
            "priceRub": 1500,
            "participants": [{ "studentId": outsider }],
        }),
    );
}
