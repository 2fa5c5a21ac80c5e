//! Canned probes installed ahead of user trees.
//!
//! Covers the failure modes every session wants reported: process
//! exits, MPI aborts, and the usual fatal signals. All built through
//! the public probe API; sessions that want different coverage simply
//! skip the install.

use crate::action::Action;
use crate::domain::Domain;
use crate::error::Result;
use crate::event::Event;
use crate::probe::{Persistence, ProbeSpec};
use crate::probe_tree::ProbeTree;

/// SIGSEGV.
const SIGSEGV: i32 = 11;
/// SIGBUS.
const SIGBUS: i32 = 7;
/// SIGFPE.
const SIGFPE: i32 = 8;

/// Register the default probe set on a tree.
pub fn install_default_probes(tree: &mut ProbeTree) -> Result<()> {
    tree.add_root(
        ProbeSpec::new(Event::exit(), Domain::world_with(2000))
            .action(Action::trace("Process exited")?)
            .action(Action::detach())
            .persistence(Persistence::Stay),
    )?;

    for symbol in ["MPI_Abort", "PMPI_Abort"] {
        tree.add_root(
            ProbeSpec::new(Event::location_pending(symbol)?, Domain::world_with(2000))
                .action(Action::trace(&format!("{symbol} called"))?)
                .action(Action::stat())
                .persistence(Persistence::Stay),
        )?;
    }

    tree.add_root(
        ProbeSpec::new(Event::signal(SIGSEGV), Domain::world_with(500).blocking(true))
            .action(Action::trace("Memory violation - segmentation fault")?)
            .action(Action::stack_trace())
            .action(Action::stat()),
    )?;

    tree.add_root(
        ProbeSpec::new(Event::signal(SIGBUS), Domain::world_with(500))
            .action(Action::trace(
                "Memory violation - bus error in function @function()",
            )?),
    )?;

    tree.add_root(
        ProbeSpec::new(Event::signal(SIGFPE), Domain::world_with(500)).action(Action::trace(
            "Floating point exception in function @function()",
        )?),
    )?;

    Ok(())
}
