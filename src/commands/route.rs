//! One-shot command-line routing.
//!
//! Drives a full controller run and prints progress to the terminal:
//! proposals with a `>>` prefix, validator lines with `<<`, and a final
//! DONE summary. The exit code classifies the stopping status.

use anyhow::Result;

use crate::controller::{
    CommandIntake, Controller, Event, IterOutcome, LogKind, STATUS_ERR_ENROUTE,
    STATUS_ERR_INTERNAL, STATUS_ERR_SID, STATUS_ERR_STAR, STATUS_STARTING, STATUS_STOPPING_DONE,
};

/// sysexits-style classification of the final status mask
pub fn exit_code_for(mask: u16) -> i32 {
    if mask & STATUS_STOPPING_DONE != 0 {
        0
    } else if mask & (STATUS_ERR_SID | STATUS_ERR_STAR | STATUS_ERR_ENROUTE) != 0 {
        65
    } else if mask & STATUS_ERR_INTERNAL != 0 {
        70
    } else {
        69
    }
}

fn print_events(controller: &mut Controller, verbose: bool) -> u16 {
    let mut final_mask = 0u16;
    for event in controller.take_events() {
        match event {
            Event::Status(mask) => {
                if mask & STATUS_STARTING != 0 {
                    eprintln!("Starting...");
                } else if mask & STATUS_STOPPING_DONE != 0 || mask != 0 {
                    final_mask = mask;
                }
            }
            Event::Log { kind, text } => match kind {
                LogKind::FplProposal => println!(">> {text}"),
                LogKind::FplRemoteValidation => println!("<< {text}"),
                LogKind::Normal | LogKind::GraphChange | LogKind::GraphRule => {
                    eprintln!("{text}")
                }
                _ => {
                    if verbose {
                        eprintln!("{text}");
                    }
                }
            },
            Event::NewPlan(_) => {}
        }
    }
    final_mask
}

pub async fn handle_route(mut controller: Controller, verbose: bool) -> Result<i32> {
    controller.preload(true).await;
    let mut final_mask = print_events(&mut controller, verbose);
    let mut running = controller.begin(false).await;
    final_mask |= print_events(&mut controller, verbose);
    let mut intake = CommandIntake::none();
    while running {
        let outcome = controller.iterate(&mut intake).await;
        final_mask |= print_events(&mut controller, verbose);
        running = outcome == IterOutcome::Continue;
    }
    if controller.is_done() {
        println!(
            "DONE: {} GC {:.1} nmi route {:.1} nmi fuel {:.1} local {} remote {} wall {:.1}s validator {:.1}s",
            controller.plan_text(),
            controller.gc_distance_nmi(),
            controller.route_distance_nmi(),
            controller.route().route_fuel_usg,
            controller.local_iterations(),
            controller.remote_iterations(),
            controller.wallclock_secs(),
            controller.validator_secs(),
        );
    } else {
        eprintln!(
            "FAILED after local {} remote {} iterations, wall {:.1}s",
            controller.local_iterations(),
            controller.remote_iterations(),
            controller.wallclock_secs(),
        );
    }
    controller.shutdown().await;
    let _ = print_events(&mut controller, verbose);
    Ok(exit_code_for(final_mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{STATUS_ERR_ITERATION, STATUS_ERR_USER, STATUS_ERR_VALIDATOR_TIMEOUT};

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(STATUS_STOPPING_DONE), 0);
        assert_eq!(exit_code_for(STATUS_ERR_ENROUTE), 65);
        assert_eq!(exit_code_for(STATUS_ERR_SID), 65);
        assert_eq!(exit_code_for(STATUS_ERR_INTERNAL), 70);
        assert_eq!(exit_code_for(STATUS_ERR_VALIDATOR_TIMEOUT), 69);
        assert_eq!(exit_code_for(STATUS_ERR_ITERATION), 69);
        assert_eq!(exit_code_for(STATUS_ERR_USER), 69);
    }
}
