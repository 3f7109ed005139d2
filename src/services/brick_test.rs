use super::*;
use serde_json::json;

fn style() -> StrokeStyle {
    StrokeStyle { color: "#f00".into(), thickness: 3.0 }
}

fn pt(x: f64, y: f64) -> Point {
    Point { x, y }
}

// =============================================================================
// STROKES
// =============================================================================

#[test]
fn begin_path_opens_empty_temp_path() {
    let user = Uuid::new_v4();
    let mut brick = Brick::new(1, BrickKind::Draw);
    brick.begin_path(user, style());

    let path = brick.temp_path(user).expect("temp path should be open");
    assert_eq!(path.style, style());
    assert!(path.points.is_empty());
}

#[test]
fn begin_path_twice_overwrites_without_merging() {
    let user = Uuid::new_v4();
    let mut brick = Brick::new(1, BrickKind::Draw);
    brick.begin_path(user, style());
    brick.add_path_points(user, &[pt(1.0, 1.0)]).unwrap();

    let thick = StrokeStyle { color: "#00f".into(), thickness: 9.0 };
    brick.begin_path(user, thick.clone());

    let path = brick.temp_path(user).unwrap();
    assert_eq!(path.style, thick);
    assert!(path.points.is_empty());
}

#[test]
fn add_path_points_extends_in_call_order() {
    let user = Uuid::new_v4();
    let mut brick = Brick::new(1, BrickKind::Draw);
    brick.begin_path(user, style());
    brick.add_path_points(user, &[pt(0.0, 0.0)]).unwrap();
    brick.add_path_points(user, &[pt(1.0, 1.0), pt(2.0, 2.0)]).unwrap();

    let points = &brick.temp_path(user).unwrap().points;
    assert_eq!(points, &vec![pt(0.0, 0.0), pt(1.0, 1.0), pt(2.0, 2.0)]);
}

#[test]
fn add_path_points_without_open_path_fails() {
    let user = Uuid::new_v4();
    let mut brick = Brick::new(1, BrickKind::Draw);
    let err = brick.add_path_points(user, &[pt(0.0, 0.0)]).unwrap_err();
    assert!(matches!(err, BrickError::NoUnfinishedPath(u) if u == user));
    assert_eq!(err.error_code(), "E_NO_UNFINISHED_PATH");
}

#[test]
fn end_path_commits_spline_and_clears_temp() {
    let user = Uuid::new_v4();
    let mut brick = Brick::new(1, BrickKind::Draw);
    brick.begin_path(user, style());
    brick.end_path(user, json!({"c": [0, 1]}), "s1".into()).unwrap();

    assert!(brick.temp_path(user).is_none());
    assert_eq!(brick.splines().len(), 1);
    assert_eq!(brick.splines()[0].id, "s1");
    assert_eq!(brick.splines()[0].spline, json!({"c": [0, 1]}));
}

#[test]
fn end_path_without_open_path_fails() {
    let mut brick = Brick::new(1, BrickKind::Draw);
    assert!(brick.end_path(Uuid::new_v4(), json!(null), "s1".into()).is_err());
    assert!(brick.splines().is_empty());
}

#[test]
fn end_path_rejects_duplicate_spline_id_and_keeps_stroke_open() {
    let user = Uuid::new_v4();
    let mut brick = Brick::new(1, BrickKind::Draw);
    brick.begin_path(user, style());
    brick.end_path(user, json!(1), "s1".into()).unwrap();
    brick.begin_path(user, style());

    let err = brick.end_path(user, json!(2), "s1".into()).unwrap_err();
    assert!(matches!(err, BrickError::DuplicateSpline(_)));
    assert_eq!(brick.splines().len(), 1);
    assert!(brick.temp_path(user).is_some());
}

#[test]
fn spline_id_reusable_after_erase() {
    let user = Uuid::new_v4();
    let mut brick = Brick::new(1, BrickKind::Draw);
    brick.begin_path(user, style());
    brick.end_path(user, json!(1), "s1".into()).unwrap();
    brick.erase_splines(&["s1".into()]);
    brick.begin_path(user, style());
    brick.end_path(user, json!(2), "s1".into()).unwrap();
    assert_eq!(brick.splines()[0].spline, json!(2));
}

#[test]
fn erase_splines_removes_matches_and_preserves_order() {
    let user = Uuid::new_v4();
    let mut brick = Brick::new(1, BrickKind::Draw);
    for id in ["a", "b", "c", "d"] {
        brick.begin_path(user, style());
        brick.end_path(user, json!(id), id.into()).unwrap();
    }

    brick.erase_splines(&["c".into(), "a".into(), "zzz".into()]);

    let ids: Vec<&str> = brick.splines().iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "d"]);
}

#[test]
fn erase_absent_ids_is_noop() {
    let user = Uuid::new_v4();
    let mut brick = Brick::new(1, BrickKind::Draw);
    brick.begin_path(user, style());
    brick.end_path(user, json!(1), "s1".into()).unwrap();
    brick.erase_splines(&["nope".into()]);
    assert_eq!(brick.splines().len(), 1);
}

#[test]
fn disconnect_client_discards_open_stroke() {
    let leaver = Uuid::new_v4();
    let stayer = Uuid::new_v4();
    let mut brick = Brick::new(1, BrickKind::Draw);
    brick.begin_path(leaver, style());
    brick.begin_path(stayer, style());

    assert!(brick.disconnect_client(leaver));
    assert!(!brick.disconnect_client(leaver));
    assert!(brick.temp_path(leaver).is_none());
    assert!(brick.temp_path(stayer).is_some());
    assert!(brick.splines().is_empty());
}

// =============================================================================
// TEXT
// =============================================================================

#[test]
fn apply_changes_retain_delete_insert() {
    let changes = [TextChange::Retain(6), TextChange::Delete(5), TextChange::Insert("brick".into())];
    assert_eq!(apply_changes("hello world", &changes).unwrap(), "hello brick");
}

#[test]
fn apply_changes_delete_advances_by_delete_count() {
    let changes = [TextChange::Retain(1), TextChange::Delete(3), TextChange::Retain(1)];
    assert_eq!(apply_changes("abcdef", &changes).unwrap(), "aef");
}

#[test]
fn apply_changes_appends_untouched_tail() {
    let changes = [TextChange::Insert(">> ".into())];
    assert_eq!(apply_changes("tail", &changes).unwrap(), ">> tail");
}

#[test]
fn apply_changes_empty_script_is_identity() {
    assert_eq!(apply_changes("same", &[]).unwrap(), "same");
}

#[test]
fn apply_changes_counts_chars_not_bytes() {
    let changes = [TextChange::Retain(1), TextChange::Delete(1)];
    assert_eq!(apply_changes("héllo", &changes).unwrap(), "hllo");
}

#[test]
fn apply_changes_rejects_overrun() {
    let err = apply_changes("abc", &[TextChange::Retain(2), TextChange::Delete(2)]).unwrap_err();
    assert!(matches!(err, BrickError::ScriptOverrun { needed: 4, len: 3 }));
}

#[test]
fn text_insert_on_text_brick_updates_text() {
    let mut brick = Brick::new(4, BrickKind::Text);
    brick.text_insert(&[TextChange::Insert("hi".into())]).unwrap();
    brick.text_insert(&[TextChange::Retain(2), TextChange::Insert(" there".into())]).unwrap();
    assert_eq!(brick.text(), Some("hi there"));
}

#[test]
fn text_insert_overrun_leaves_text_untouched() {
    let mut brick = Brick::new(4, BrickKind::Text);
    brick.text_insert(&[TextChange::Insert("abc".into())]).unwrap();
    assert!(brick.text_insert(&[TextChange::Delete(10)]).is_err());
    assert_eq!(brick.text(), Some("abc"));
}

#[test]
fn text_insert_on_draw_brick_fails() {
    let mut brick = Brick::new(2, BrickKind::Draw);
    let err = brick.text_insert(&[TextChange::Insert("x".into())]).unwrap_err();
    assert!(matches!(err, BrickError::NotText(2)));
    assert_eq!(brick.text(), None);
}

#[test]
fn text_brick_accepts_strokes() {
    let user = Uuid::new_v4();
    let mut brick = Brick::new(5, BrickKind::Text);
    brick.begin_path(user, style());
    brick.add_path_points(user, &[pt(3.0, 4.0)]).unwrap();
    brick.end_path(user, json!("curve"), "t1".into()).unwrap();
    assert_eq!(brick.splines().len(), 1);
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

#[test]
fn lean_includes_temp_paths_but_save_does_not() {
    let user = Uuid::new_v4();
    let mut brick = Brick::new(1, BrickKind::Draw);
    brick.begin_path(user, style());

    assert!(brick.lean().temp_paths.contains_key(&user));
    assert!(brick.save().temp_paths.is_empty());
}

#[test]
fn load_of_save_reproduces_content() {
    let user = Uuid::new_v4();
    let mut brick = Brick::new(7, BrickKind::Text);
    brick.text_insert(&[TextChange::Insert("notes".into())]).unwrap();
    brick.begin_path(user, style());
    brick.end_path(user, json!([1, 2, 3]), "s1".into()).unwrap();

    let restored = Brick::load(&brick.save());
    assert_eq!(restored.id(), 7);
    assert_eq!(restored.kind(), BrickKind::Text);
    assert_eq!(restored.text(), Some("notes"));
    assert_eq!(restored.splines(), brick.splines());
    assert_eq!(restored.save(), brick.save());
}
