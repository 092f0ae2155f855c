use std::collections::HashSet;

use crate::foundation::error::{AnimakeError, AnimakeResult};
use crate::foundation::ids::{ItemId, LayerId, TimelineId};
use crate::foundation::paths::normalize_rel_path;
use crate::script::store::Script;

/// Pointer to one exact script revision.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ScriptRef {
    /// Script lineage id.
    pub script_id: String,
    /// Revision pinned when the item was placed.
    pub version: u64,
}

impl From<&Script> for ScriptRef {
    fn from(script: &Script) -> Self {
        Self {
            script_id: script.id.clone(),
            version: script.version,
        }
    }
}

/// Pointer to an external asset, relative to the project root.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct AssetRef {
    /// Normalized relative path (`/` separators, no `..`).
    pub path: String,
}

impl AssetRef {
    /// Validate and normalize `path`.
    pub fn new(path: &str) -> AnimakeResult<Self> {
        Ok(Self {
            path: normalize_rel_path(path)?,
        })
    }
}

/// What a timeline item displays.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemSource {
    /// A fragment of generated or hand-edited script.
    Script(ScriptRef),
    /// A static asset file.
    Asset(AssetRef),
}

/// Placement request for [`Timeline::add_item`].
#[derive(Clone, Debug, PartialEq)]
pub struct NewItem {
    /// Offset from the timeline origin, in seconds.
    pub start: f64,
    /// Length in seconds.
    pub duration: f64,
    /// Content reference.
    pub source: ItemSource,
}

impl NewItem {
    /// Convenience constructor for a script-backed item.
    pub fn script(start: f64, duration: f64, script: &Script) -> Self {
        Self {
            start,
            duration,
            source: ItemSource::Script(script.into()),
        }
    }
}

/// One timed element on a layer.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TimelineItem {
    /// Stable id within the timeline.
    pub id: ItemId,
    /// Offset from the timeline origin, in seconds.
    pub start: f64,
    /// Length in seconds.
    pub duration: f64,
    /// Content reference.
    pub source: ItemSource,
}

impl TimelineItem {
    /// Exclusive end time.
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// An independent track; items never overlap within one layer.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Layer {
    /// Stable id within the timeline.
    pub id: LayerId,
    /// Composite order; higher draws on top. Unique within the timeline.
    pub z_index: u32,
    items: Vec<TimelineItem>, // sorted by start
}

impl Layer {
    /// Items ordered by start time.
    pub fn items(&self) -> &[TimelineItem] {
        &self.items
    }

    fn overlapping(&self, start: f64, end: f64, ignore: Option<ItemId>) -> Option<&TimelineItem> {
        self.items
            .iter()
            .filter(|it| Some(it.id) != ignore)
            .find(|it| it.start < end && start < it.end())
    }

    fn insert_sorted(&mut self, item: TimelineItem) {
        let idx = self
            .items
            .partition_point(|it| (it.start, it.id) < (item.start, item.id));
        self.items.insert(idx, item);
    }
}

/// Ordered collection of layers, each an ordered track of timed items.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Timeline {
    id: TimelineId,
    layers: Vec<Layer>, // ascending z_index
    next_layer: u64,
    next_item: u64,
}

impl Timeline {
    /// Create an empty timeline.
    pub fn new(id: TimelineId) -> Self {
        Self {
            id,
            layers: Vec::new(),
            next_layer: 1,
            next_item: 1,
        }
    }

    /// Timeline id.
    pub fn id(&self) -> TimelineId {
        self.id
    }

    /// Layers in ascending z-index order (bottom first).
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Look up a layer.
    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    /// Look up an item and the layer holding it.
    pub fn item(&self, id: ItemId) -> Option<(&Layer, &TimelineItem)> {
        self.layers
            .iter()
            .find_map(|l| l.items.iter().find(|it| it.id == id).map(|it| (l, it)))
    }

    /// End of the last item, in seconds (0 for an empty timeline).
    pub fn duration(&self) -> f64 {
        self.layers
            .iter()
            .flat_map(|l| l.items.iter())
            .map(TimelineItem::end)
            .fold(0.0, f64::max)
    }

    /// Add an empty layer on top of the stack.
    pub fn add_layer(&mut self) -> LayerId {
        let id = LayerId(self.next_layer);
        self.next_layer += 1;
        let z_index = self.layers.last().map(|l| l.z_index + 1).unwrap_or(0);
        self.layers.push(Layer {
            id,
            z_index,
            items: Vec::new(),
        });
        id
    }

    /// Remove a layer together with all of its items.
    pub fn remove_layer(&mut self, id: LayerId) -> AnimakeResult<Layer> {
        let idx = self.layer_index(id)?;
        let layer = self.layers.remove(idx);
        tracing::debug!(timeline = %self.id, layer = %id, items = layer.items.len(), "layer removed");
        Ok(layer)
    }

    /// Move a layer to `position` in the bottom-to-top order and renumber z-indices `0..n`.
    ///
    /// Layers other than `id` keep their relative order.
    pub fn reorder_layer(&mut self, id: LayerId, position: usize) -> AnimakeResult<()> {
        let idx = self.layer_index(id)?;
        let layer = self.layers.remove(idx);
        let position = position.min(self.layers.len());
        self.layers.insert(position, layer);
        for (z, layer) in self.layers.iter_mut().enumerate() {
            layer.z_index = z as u32;
        }
        Ok(())
    }

    /// Place a new item on `layer`.
    pub fn add_item(&mut self, layer: LayerId, item: NewItem) -> AnimakeResult<ItemId> {
        validate_timing(item.start, item.duration)?;
        let source = normalize_source(item.source)?;
        let idx = self.layer_index(layer)?;
        let end = item.start + item.duration;
        if let Some(other) = self.layers[idx].overlapping(item.start, end, None) {
            return Err(overlap_error(layer, item.start, end, other));
        }

        let id = ItemId(self.next_item);
        self.next_item += 1;
        self.layers[idx].insert_sorted(TimelineItem {
            id,
            start: item.start,
            duration: item.duration,
            source,
        });
        Ok(id)
    }

    /// Move an item to another layer and/or start time.
    ///
    /// On error the timeline is left untouched.
    pub fn move_item(
        &mut self,
        item: ItemId,
        new_layer: Option<LayerId>,
        new_start: Option<f64>,
    ) -> AnimakeResult<()> {
        let (src_idx, pos) = self.item_position(item)?;
        let current = &self.layers[src_idx].items[pos];
        let start = new_start.unwrap_or(current.start);
        validate_timing(start, current.duration)?;
        let end = start + current.duration;

        let dst_idx = match new_layer {
            Some(l) => self.layer_index(l)?,
            None => src_idx,
        };
        let dst = &self.layers[dst_idx];
        if let Some(other) = dst.overlapping(start, end, Some(item)) {
            return Err(overlap_error(dst.id, start, end, other));
        }

        let mut moved = self.layers[src_idx].items.remove(pos);
        moved.start = start;
        self.layers[dst_idx].insert_sorted(moved);
        Ok(())
    }

    /// Change an item's duration, keeping its start.
    pub fn resize_item(&mut self, item: ItemId, duration: f64) -> AnimakeResult<()> {
        let (idx, pos) = self.item_position(item)?;
        let start = self.layers[idx].items[pos].start;
        validate_timing(start, duration)?;
        let layer = &self.layers[idx];
        if let Some(other) = layer.overlapping(start, start + duration, Some(item)) {
            return Err(overlap_error(layer.id, start, start + duration, other));
        }
        self.layers[idx].items[pos].duration = duration;
        Ok(())
    }

    /// Remove a single item.
    pub fn remove_item(&mut self, item: ItemId) -> AnimakeResult<TimelineItem> {
        let (idx, pos) = self.item_position(item)?;
        Ok(self.layers[idx].items.remove(pos))
    }

    /// Check every structural invariant; used after deserializing a timeline.
    pub fn validate(&self) -> AnimakeResult<()> {
        let mut layer_ids = HashSet::new();
        let mut item_ids = HashSet::new();
        for (i, layer) in self.layers.iter().enumerate() {
            if !layer_ids.insert(layer.id) || layer.id.0 >= self.next_layer {
                return Err(AnimakeError::validation(format!(
                    "duplicate or unallocated layer id {}",
                    layer.id
                )));
            }
            if i > 0 && self.layers[i - 1].z_index >= layer.z_index {
                return Err(AnimakeError::validation(
                    "layer z-indices must be unique and ascending",
                ));
            }
            for (j, item) in layer.items.iter().enumerate() {
                if !item_ids.insert(item.id) || item.id.0 >= self.next_item {
                    return Err(AnimakeError::validation(format!(
                        "duplicate or unallocated item id {}",
                        item.id
                    )));
                }
                validate_timing(item.start, item.duration)?;
                if let ItemSource::Asset(asset) = &item.source {
                    normalize_rel_path(&asset.path)?;
                }
                if j > 0 {
                    let prev = &layer.items[j - 1];
                    if prev.start > item.start {
                        return Err(AnimakeError::validation(format!(
                            "items on {} are not ordered by start",
                            layer.id
                        )));
                    }
                    if prev.end() > item.start {
                        return Err(overlap_error(layer.id, item.start, item.end(), prev));
                    }
                }
            }
        }
        Ok(())
    }

    fn layer_index(&self, id: LayerId) -> AnimakeResult<usize> {
        self.layers
            .iter()
            .position(|l| l.id == id)
            .ok_or_else(|| AnimakeError::not_found(format!("{id} on {}", self.id)))
    }

    fn item_position(&self, id: ItemId) -> AnimakeResult<(usize, usize)> {
        self.layers
            .iter()
            .enumerate()
            .find_map(|(li, l)| l.items.iter().position(|it| it.id == id).map(|pos| (li, pos)))
            .ok_or_else(|| AnimakeError::not_found(format!("{id} on {}", self.id)))
    }
}

fn validate_timing(start: f64, duration: f64) -> AnimakeResult<()> {
    if !start.is_finite() || start < 0.0 {
        return Err(AnimakeError::validation(
            "item start must be finite and >= 0",
        ));
    }
    if !duration.is_finite() || duration <= 0.0 {
        return Err(AnimakeError::validation(
            "item duration must be finite and > 0",
        ));
    }
    if !(start + duration).is_finite() {
        return Err(AnimakeError::validation("item end must be finite"));
    }
    Ok(())
}

fn normalize_source(source: ItemSource) -> AnimakeResult<ItemSource> {
    match source {
        ItemSource::Asset(asset) => Ok(ItemSource::Asset(AssetRef::new(&asset.path)?)),
        ItemSource::Script(r) => {
            if r.version == 0 {
                return Err(AnimakeError::validation("script versions start at 1"));
            }
            Ok(ItemSource::Script(r))
        }
    }
}

fn overlap_error(layer: LayerId, start: f64, end: f64, other: &TimelineItem) -> AnimakeError {
    AnimakeError::overlap(format!(
        "[{start}, {end}) on {layer} overlaps {} at [{}, {})",
        other.id,
        other.start,
        other.end()
    ))
}

#[cfg(test)]
#[path = "../../tests/unit/timeline/model.rs"]
mod tests;
