//! Tasks that ship with drover. Game-specific catalogs register their own
//! tasks next to these.

mod close_popups;
mod dispatch_idle;
mod tap_buttons;

pub use close_popups::ClosePopups;
pub use dispatch_idle::DispatchIdle;
pub use tap_buttons::TapButtons;

use crate::error::Result;
use crate::task::TaskRegistry;

pub fn register_builtins(registry: &mut TaskRegistry) -> Result<()> {
    registry.register(Box::new(ClosePopups))?;
    registry.register(Box::new(TapButtons))?;
    registry.register(Box::new(DispatchIdle))?;
    Ok(())
}
