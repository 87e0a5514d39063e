pub mod colors;
pub mod error;
pub mod events;
pub mod fusion;
pub mod grid;
pub mod health;
pub mod render;
pub mod selection;
pub mod session;

pub use colors::{Fill, Legend, MetricKind, MetricRegistry, MetricScale, Rgb};
pub use error::{FuseError, FuseResult};
pub use events::*;
pub use fusion::{FusionCache, FusionRecord, SourceKey, SourceKind};
pub use grid::{Cell, CellId, CollectionKind, GeometryDocument, GridStore};
pub use health::DeviceHealthSummary;
pub use render::{RenderController, RenderFrame, RenderInstruction, RenderPhase};
pub use selection::{Selection, SelectionPatch, SelectionState};
pub use session::{Session, SessionEvent, SessionOutcome};
