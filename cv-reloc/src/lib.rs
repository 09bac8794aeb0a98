//! Re-localization of single camera images against a prebuilt sparse map.
//!
//! A [`Localizer`] owns one [`Map`] and answers queries by retrieving similar
//! database images, matching local features against them, grouping the
//! candidates by covisibility and solving an absolute pose per group. The
//! winning pose is carried through the map calibration into a [`GeoPose`].
//! A [`MapRegistry`] keeps several maps loaded and routes queries to the
//! current one.

mod calibration;
mod camera;
mod capability;
mod config;
mod covisibility;
mod descriptors;
mod errors;
mod export;
mod features;
pub mod geodesy;
mod localizer;
mod map;
mod matching;
mod pnp;
mod reconstruction;
mod registry;
mod retrieval;
mod selection;
mod settings;
mod solve;
mod transform;

pub use calibration::*;
pub use camera::*;
pub use capability::*;
pub use config::*;
pub use covisibility::*;
pub use descriptors::*;
pub use errors::*;
pub use export::*;
pub use features::*;
pub use geodesy::GeodeticPosition;
pub use localizer::*;
pub use map::*;
pub use matching::*;
pub use pnp::*;
pub use reconstruction::*;
pub use registry::*;
pub use retrieval::*;
pub use selection::*;
pub use settings::*;
pub use solve::*;
pub use transform::*;
