use super::*;
use crate::compose::resolver::resolve;
use crate::foundation::ids::{LayerId, TimelineId};
use crate::script::store::{ScriptStore, ScriptStoreOpts};
use crate::timeline::model::{NewItem, Timeline};

struct Fixture {
    scripts: ScriptStore,
    timeline: Timeline,
    bottom: LayerId,
    top: LayerId,
}

fn fixture() -> Fixture {
    let scripts = ScriptStore::new("scene", ScriptStoreOpts::default());
    let v1 = scripts.set("scene A");
    let mut timeline = Timeline::new(TimelineId(1));
    let bottom = timeline.add_layer();
    let top = timeline.add_layer();
    timeline.add_item(bottom, NewItem::script(0.0, 5.0, &v1)).unwrap();
    timeline.add_item(top, NewItem::script(1.0, 2.0, &v1)).unwrap();
    Fixture {
        scripts,
        timeline,
        bottom,
        top,
    }
}

fn fp(f: &Fixture) -> Fingerprint {
    let spec = resolve(&f.timeline, &f.scripts).unwrap();
    fingerprint(&spec, Quality::Low, Format::Mp4)
}

#[test]
fn same_inputs_same_fingerprint() {
    let f = fixture();
    assert_eq!(fp(&f), fp(&f));
}

#[test]
fn quality_and_format_are_part_of_the_key() {
    let f = fixture();
    let spec = resolve(&f.timeline, &f.scripts).unwrap();
    let low = fingerprint(&spec, Quality::Low, Format::Mp4);
    assert_ne!(low, fingerprint(&spec, Quality::High, Format::Mp4));
    assert_ne!(low, fingerprint(&spec, Quality::Low, Format::Gif));
    assert_eq!(
        spec.with_target(Quality::Low, Format::Mp4).fingerprint(),
        low
    );
}

#[test]
fn timing_change_changes_fingerprint() {
    let mut f = fixture();
    let before = fp(&f);
    let item = f.timeline.layer(f.top).unwrap().items()[0].id;
    f.timeline.move_item(item, None, Some(1.5)).unwrap();
    assert_ne!(before, fp(&f));
}

#[test]
fn script_version_change_changes_fingerprint_even_with_same_text() {
    let mut f = fixture();
    let before = fp(&f);
    let v2 = f.scripts.set("scene A");
    let item = f.timeline.layer(f.top).unwrap().items()[0].id;
    f.timeline.remove_item(item).unwrap();
    f.timeline
        .add_item(f.top, NewItem::script(1.0, 2.0, &v2))
        .unwrap();
    assert_ne!(before, fp(&f));
}

#[test]
fn renumbering_without_order_change_keeps_fingerprint() {
    let mut f = fixture();
    let extra = f.timeline.add_layer();
    let before = fp(&f);
    // Removing the empty top-most layer and renumbering leaves the composite order intact.
    f.timeline.remove_layer(extra).unwrap();
    f.timeline.reorder_layer(f.bottom, 0).unwrap();
    assert_eq!(before, fp(&f));
}

#[test]
fn composite_order_change_changes_fingerprint() {
    let mut f = fixture();
    let before = fp(&f);
    f.timeline.reorder_layer(f.top, 0).unwrap();
    assert_ne!(before, fp(&f));
}

#[test]
fn hex_round_trips_through_serde() {
    let f = fixture();
    let a = fp(&f);
    let hex = a.to_hex();
    assert_eq!(hex.len(), 32);
    assert_eq!(hex.parse::<Fingerprint>().unwrap(), a);
    let json = serde_json::to_string(&a).unwrap();
    assert_eq!(json, format!("\"{hex}\""));
    assert_eq!(serde_json::from_str::<Fingerprint>(&json).unwrap(), a);
    assert!("xyz".parse::<Fingerprint>().is_err());
}
