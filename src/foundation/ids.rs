use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a [`Timeline`](crate::Timeline).
    TimelineId,
    "timeline"
);
id_type!(
    /// Identifier of a layer, unique within its timeline.
    LayerId,
    "layer"
);
id_type!(
    /// Identifier of a timeline item, unique within its timeline.
    ItemId,
    "item"
);
id_type!(
    /// Identifier of a render job, unique within one manager (and its journal).
    JobId,
    "job"
);
