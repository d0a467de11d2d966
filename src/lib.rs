//! # electrode_nav
//!
//! Navigation core for a microfluidic electrode array: directional neighbour
//! search over arbitrary polygon layouts, and the selection/activation state
//! machine that keeps electrode on/off state in step with a remote controller
//! over a publish/subscribe bus.
//!
//! ## Quick Start
//!
//! ```
//! use electrode_nav::prelude::*;
//!
//! let layout = electrode_nav::layout::unit_grid(3, 3);
//! let resolver = NeighbourResolver::default();
//!
//! let right = resolver
//!     .find_neighbour(&layout, "e11", Direction::Right, 1.0)
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(right.target, "e12");
//! ```
//!
//! ## Feature Flags
//!
//! - `parallel`: Build whole-layout neighbour tables on rayon
//!
//! ## Modules
//!
//! - [`geometry`]: Points, rays, bounding boxes and polygons
//! - [`layout`]: Electrode records and the indexed layout
//! - [`neighbours`]: Directional neighbour search
//! - [`selection`]: Selection/activation controller
//! - [`sync`]: State-sync collaborator trait and in-process bus
//! - [`interaction`]: Press/release pairing
//! - [`config`]: Combined JSON configuration

#[path = "core/geometry.rs"]
pub mod geometry;

#[path = "core/layout.rs"]
pub mod layout;

#[path = "core/neighbours.rs"]
pub mod neighbours;

#[path = "core/sync.rs"]
pub mod sync;

#[path = "core/selection.rs"]
pub mod selection;

#[path = "core/interaction.rs"]
pub mod interaction;

#[path = "core/config.rs"]
pub mod config;

/// Convenient re-exports for common usage.
///
/// ```
/// use electrode_nav::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::NavConfig;
    pub use crate::geometry::{GeometryError, Point, Polygon};
    pub use crate::interaction::{Modifiers, PointerButton, PressTracker, ReleaseOutcome};
    pub use crate::layout::{Electrode, Layout, LayoutError};
    pub use crate::neighbours::{Direction, NeighbourMap, NeighbourResolver, NeighbourResult};
    pub use crate::selection::{
        ControllerConfig, ControllerError, ControllerEvent, ElectrodeEdit, ElectrodeSelectionController,
        MoveOutcome, MovePolicy, ToggleOutcome,
    };
    pub use crate::sync::{LocalBus, StateSync, SyncError};
}
