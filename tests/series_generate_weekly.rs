
use serde_json::json;
use test_support::{request_ok, spawn_sidecar, temp_dir};

#[test]
fn weekly_series_materializes_exact_occurrences() {
    let workspace = temp_dir("tutorbook-series-weekly");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "teacherId": "t1", "name": "Mathematics" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "teacherId": "t1", "displayName": "Vasya P." }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "lessons.create",
        json!({
            "teacherId": "t1",
            "subjectId": subject_id,
            "startAt": "2026-09-01T16:00:00",
            "durationMinutes": 60,
            "priceRub": 1500,
            "participants": [{ "studentId": student_id }],
            "recurrence": { "frequency": "weekly", "maxOccurrences": 5 }
        }),
    );
    assert_eq!(created.get("occurrenceCount").and_then(|v| v.as_i64()), Some(5));
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
            "2026-09-01T16:00:00",
            "2026-09-08T16:00:00",
            "2026-09-15T16:00:00",
            "2026-09-22T16:00:00",
            "2026-09-29T16:00:00",
        ]
    );

    // Every occurrence carries the template duration and price.
    for (i, occ) in occurrences.iter().enumerate() {
        let lesson_id = occ.get("lessonId").and_then(|v| v.as_str()).expect("lessonId");
        let opened = request_ok(
            &mut stdin,
            &mut reader,
            &format!("open-{}", i),
            "lessons.open",
            json!({ "lessonId": lesson_id }),
        );
        assert_eq!(opened.pointer("/lesson/durationMinutes").and_then(|v| v.as_i64()), Some(60));
        assert_eq!(opened.pointer("/lesson/priceRub").and_then(|v| v.as_i64()), Some(1500));
        assert_eq!(opened.pointer("/lesson/status").and_then(|v| v.as_str()), Some("planned"));
        let participants = opened
            .pointer("/lesson/participants")
            .and_then(|v| v.as_array())
            .expect("participants");
        assert_eq!(participants.len(), 1);
        assert_eq!(
            participants[0].get("attendance").and_then(|v| v.as_str()),
            Some("unknown")
        );
    }
}

#[test]
fn unbounded_recurrence_defaults_to_ten_occurrences() {
    let workspace = temp_dir("tutorbook-series-default");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "teacherId": "t1", "name": "Physics" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "teacherId": "t1", "displayName": "Masha K." }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "lessons.create",
        json!({
            "teacherId": "t1",
            "subjectId": subject_id,
            "startAt": "2026-09-03T10:00:00",
            "durationMinutes": 90,
            "priceRub": 2000,
            "participants": [{ "studentId": student_id }],
            "recurrence": { "frequency": "weekly" }
        }),
    );
    assert_eq!(created.get("occurrenceCount").and_then(|v| v.as_i64()), Some(10));
}

#[test]
fn per_student_price_override_applies_to_every_occurrence() {
    let workspace = temp_dir("tutorbook-series-override");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "teacherId": "t1", "name": "Chemistry" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let full_price = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "teacherId": "t1", "displayName": "Full Price" }),
    );
    let full_price_id = full_price
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let discounted = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "teacherId": "t1", "displayName": "Discounted" }),
    );
    let discounted_id = discounted
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "lessons.create",
        json!({
            "teacherId": "t1",
            "subjectId": subject_id,
            "startAt": "2026-09-07T12:00:00",
            "durationMinutes": 60,
            "priceRub": 1800,
            "participants": [
                { "studentId": full_price_id },
                { "studentId": discounted_id, "priceRub": 1200 }
            ],
            "recurrence": { "frequency": "weekly", "maxOccurrences": 3 }
        }),
    );
    let occurrences = created
        .get("occurrences")
        .and_then(|v| v.as_array())
        .expect("occurrences");
    assert_eq!(occurrences.len(), 3);

    for (i, occ) in occurrences.iter().enumerate() {
        let lesson_id = occ.get("lessonId").and_then(|v| v.as_str()).expect("lessonId");
        let opened = request_ok(
            &mut stdin,
            &mut reader,
            &format!("open-{}", i),
            "lessons.open",
            json!({ "lessonId": lesson_id }),
        );
        let participants = opened
            .pointer("/lesson/participants")
            .and_then(|v| v.as_array())
            .expect("participants");
        assert_eq!(participants.len(), 2);
        for p in participants {
            let sid = p.get("studentId").and_then(|v| v.as_str()).expect("studentId");
            let price = p.get("priceRub").and_then(|v| v.as_i64()).expect("priceRub");
            if sid == discounted_id {
                assert_eq!(price, 1200);
            } else {
                assert_eq!(price, 1800);
            }
        }
    }
}
