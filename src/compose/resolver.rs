use std::collections::{HashMap, HashSet};

use anyhow::Context as _;
use regex::Regex;

use crate::compose::spec::{Format, Quality, RenderSpec, ResolvedItem, ResolvedSource};
use crate::foundation::error::{AnimakeError, AnimakeResult};
use crate::script::store::ScriptStore;
use crate::timeline::model::{ItemSource, Timeline};

/// Separator placed between distinct script fragments in the resolved script text.
const FRAGMENT_SEPARATOR: &str = "\n\n";

/// Merge a timeline and its script history into one [`RenderSpec`].
///
/// Layers are walked bottom to top, items by start time. Script items bind to the version pinned
/// on the item, not the latest one, so resolving the same snapshot later yields the same spec.
/// The resolved script text is each distinct referenced revision, in first-appearance order,
/// joined by a blank line. Two revisions that both define a top-level class of the same name
/// are rejected, since the later definition would silently replace the earlier one.
///
/// The result targets [`Quality::Medium`]/[`Format::Mp4`]; use [`RenderSpec::with_target`] to
/// retarget it.
#[tracing::instrument(skip(timeline, scripts), fields(timeline = %timeline.id()))]
pub fn resolve(timeline: &Timeline, scripts: &ScriptStore) -> AnimakeResult<RenderSpec> {
    let mut items = Vec::new();
    let mut fragments = Vec::<String>::new();
    let mut seen = HashSet::<u64>::new();
    let mut classes = HashMap::<String, u64>::new();
    let class_def = Regex::new(r"(?m)^class\s+(\w+)").context("invalid class pattern")?;
    let mut duration = 0.0f64;

    for (rank, layer) in timeline.layers().iter().enumerate() {
        for item in layer.items() {
            let source = match &item.source {
                ItemSource::Script(r) => {
                    if r.script_id != scripts.id() {
                        return Err(AnimakeError::DanglingReference {
                            script_id: r.script_id.clone(),
                            version: r.version,
                        });
                    }
                    let script = scripts.get(Some(r.version)).map_err(|_| {
                        tracing::error!(
                            script = %r.script_id,
                            version = r.version,
                            "timeline references a script version the store no longer retains"
                        );
                        AnimakeError::DanglingReference {
                            script_id: r.script_id.clone(),
                            version: r.version,
                        }
                    })?;
                    if seen.insert(r.version) {
                        for caps in class_def.captures_iter(&script.content) {
                            let name = &caps[1];
                            match classes.get(name) {
                                Some(&earlier) if earlier != r.version => {
                                    return Err(AnimakeError::validation(format!(
                                        "class '{name}' is defined by both version {earlier} and \
                                         version {} of script '{}'",
                                        r.version, r.script_id
                                    )));
                                }
                                Some(_) => {}
                                None => {
                                    classes.insert(name.to_string(), r.version);
                                }
                            }
                        }
                        fragments.push(script.content.clone());
                    }
                    ResolvedSource::Script {
                        script_id: r.script_id.clone(),
                        version: r.version,
                    }
                }
                ItemSource::Asset(a) => ResolvedSource::Asset {
                    path: a.path.clone(),
                },
            };

            let end = item.end();
            duration = duration.max(end);
            items.push(ResolvedItem {
                layer: layer.id,
                composite_rank: rank as u32,
                item: item.id,
                start: item.start,
                end,
                source,
            });
        }
    }

    if items.is_empty() {
        return Err(AnimakeError::validation(format!(
            "{} has no items to render",
            timeline.id()
        )));
    }

    tracing::debug!(items = items.len(), duration, "timeline resolved");
    Ok(RenderSpec {
        script: fragments.join(FRAGMENT_SEPARATOR),
        items,
        duration,
        quality: Quality::default(),
        format: Format::default(),
    })
}

#[cfg(test)]
#[path = "../../tests/unit/compose/resolver.rs"]
mod tests;
