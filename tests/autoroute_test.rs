//! End-to-end routing scenarios against the scripted mock validator.

mod common;

use common::{MockValidator, fixture_db, make_controller};

use cfmuautoroute::controller::{
    CommandIntake, Event, IterOutcome, LogKind, STATUS_ERR_VALIDATOR_TIMEOUT, STATUS_NEW_FPL,
    STATUS_STOPPING_DONE,
};

fn accepted() -> Vec<String> {
    vec!["NO ERRORS".to_string()]
}

/// Drive a full run, collecting all events
async fn run_to_completion(controller: &mut cfmuautoroute::Controller) -> Vec<Event> {
    let mut events = Vec::new();
    let mut running = controller.begin(false).await;
    events.extend(controller.take_events());
    let mut intake = CommandIntake::none();
    while running {
        let outcome = controller.iterate(&mut intake).await;
        events.extend(controller.take_events());
        running = outcome == IterOutcome::Continue;
    }
    events
}

fn final_status(events: &[Event]) -> u16 {
    events
        .iter()
        .rev()
        .find_map(|e| match e {
            Event::Status(m) if *m != STATUS_NEW_FPL => Some(*m),
            _ => None,
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn test_zurich_milano_accepted_first_try() {
    let validator = MockValidator::spawn(vec![accepted()], false);
    let mut c = make_controller(fixture_db());
    c.config_mut().departure = c.find_airport("LSZH", "");
    c.config_mut().destination = c.find_airport("LIMC", "");
    c.config_mut().set_levels(100, 250);
    c.config_mut().validator_socket =
        Some(validator.socket_path.to_string_lossy().into_owned());

    let events = run_to_completion(&mut c).await;
    assert_eq!(final_status(&events), STATUS_STOPPING_DONE);
    assert!(c.is_done());
    assert_eq!(c.remote_iterations(), 1);
    assert_eq!(validator.request_count(), 1);

    // route within 20% of the great circle
    let gc = c.gc_distance_nmi();
    let dist = c.route_distance_nmi();
    assert!(dist < gc * 1.2, "route {dist:.1} vs gc {gc:.1}");

    // exactly one cruise level across the enroute portion
    let levels: std::collections::BTreeSet<i32> = c
        .route()
        .waypoints
        .iter()
        .filter(|w| w.standard)
        .map(|w| w.altitude_ft)
        .collect();
    assert_eq!(levels.len(), 1, "levels {levels:?}");
    let cruise = *levels.iter().next().unwrap();
    assert!((10000..=20000).contains(&cruise), "cruise {cruise}");

    // plan references the procedures and the airway
    let plan = c.plan_text();
    assert!(plan.contains("VEBIT"), "{plan}");
    assert!(plan.contains("UL613"), "{plan}");
}

#[tokio::test]
async fn test_pogo_pair_skips_validator() {
    let validator = MockValidator::spawn(vec![], false);
    let mut c = make_controller(fixture_db());
    c.config_mut().departure = c.find_airport("LFPG", "");
    c.config_mut().destination = c.find_airport("LFPO", "");
    c.config_mut().validator_socket =
        Some(validator.socket_path.to_string_lossy().into_owned());

    let events = run_to_completion(&mut c).await;
    assert_eq!(final_status(&events), STATUS_STOPPING_DONE);
    assert_eq!(c.remote_iterations(), 0);
    assert_eq!(c.local_iterations(), 1);
    assert_eq!(validator.request_count(), 0);
    assert_eq!(c.route().len(), 2);
    assert_eq!(c.route().waypoints[0].altitude_ft, 3000);
    assert!(c.plan_text().contains("RMK/POGO"));
}

#[tokio::test]
async fn test_airway_closure_learned_from_validator() {
    let validator = MockValidator::spawn(
        vec![
            vec!["AWY131: Route UL612 is closed".to_string()],
            accepted(),
        ],
        false,
    );
    let mut c = make_controller(fixture_db());
    c.config_mut().departure = c.find_airport("EGLL", "");
    c.config_mut().destination = c.find_airport("EDDF", "");
    c.config_mut().set_levels(100, 150);
    c.config_mut().dctlimit_nmi = 40.0;
    c.config_mut().sid.limit_nmi = 60.0;
    c.config_mut().star.limit_nmi = 60.0;
    c.config_mut().validator_socket =
        Some(validator.socket_path.to_string_lossy().into_owned());

    let events = run_to_completion(&mut c).await;
    assert_eq!(final_status(&events), STATUS_STOPPING_DONE);
    assert_eq!(c.local_iterations(), 2);
    assert_eq!(c.remote_iterations(), 2);

    // the mutation was logged with the airway name
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Log { kind: LogKind::GraphChange, text } if text.contains("UL612")
    )));
    // the final plan no longer uses the closed airway
    let plan = c.plan_text();
    assert!(!plan.contains("UL612"), "{plan}");
    assert!(plan.contains("UL610"), "{plan}");
}

#[tokio::test]
async fn test_crossing_enforced() {
    let validator = MockValidator::spawn(vec![accepted()], false);
    let mut c = make_controller(fixture_db());
    c.config_mut().departure = c.find_airport("LOWI", "");
    c.config_mut().destination = c.find_airport("LSZH", "");
    c.config_mut().set_levels(100, 180);
    c.config_mut().validator_socket =
        Some(validator.socket_path.to_string_lossy().into_owned());
    let kpt = c.find_point("KPT", true, None).expect("KPT resolves");
    c.config_mut().crossings.push(cfmuautoroute::config::Crossing {
        ident: kpt.1.clone(),
        coord: Some(kpt.0),
        kind: kpt.2,
        radius_nmi: 10.0,
        minlevel: 120,
        maxlevel: 180,
    });

    let events = run_to_completion(&mut c).await;
    assert_eq!(final_status(&events), STATUS_STOPPING_DONE);
    let visits_kpt = c
        .route()
        .waypoints
        .iter()
        .any(|w| w.coord.distance_nmi(&kpt.0) <= 10.0);
    assert!(visits_kpt, "route must pass within 10 nmi of KPT");
}

#[tokio::test]
async fn test_vfr_fallback_avoids_restricted() {
    let mut c = make_controller(fixture_db());
    c.config_mut().departure = c.find_airport("LFPN", "");
    c.config_mut().destination = c.find_airport("LFPV", "");
    c.config_mut().departure_ifr = false;
    c.config_mut().destination_ifr = false;
    c.config_mut().vfr_airspace_limit_nmi2 = 1000.0;
    c.config_mut().dctlimit_nmi = 50.0;

    let events = run_to_completion(&mut c).await;
    assert_eq!(final_status(&events), STATUS_STOPPING_DONE);
    assert!(c.is_done());
    let route = c.route().clone();
    assert!(route.len() >= 3, "expected a detour: {:?}", route.waypoints);
    assert_eq!(route.flightrules(), 'V');

    // chosen level is the median performance row: the default band
    // FL050..FL120 has eight rows, so the middle one is FL090
    let enroute_alt: Vec<i32> = route
        .waypoints
        .iter()
        .filter(|w| w.standard)
        .map(|w| w.altitude_ft)
        .collect();
    assert!(!enroute_alt.is_empty());
    assert!(enroute_alt.iter().all(|&a| a == 9000), "{enroute_alt:?}");

    // no leg crosses the prohibited polygon
    let db = fixture_db();
    let poly = &db.airspaces[0].polygon;
    for w in route.waypoints.windows(2) {
        assert!(
            !poly.intersects_segment(&w[0].coord, &w[1].coord),
            "leg {} - {} crosses P23",
            w[0].name,
            w[1].name
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_validator_silence_times_out() {
    let validator = MockValidator::spawn(vec![], true);
    let mut c = make_controller(fixture_db());
    c.config_mut().departure = c.find_airport("LSZH", "");
    c.config_mut().destination = c.find_airport("LIMC", "");
    c.config_mut().set_levels(100, 250);
    c.config_mut().validator_socket =
        Some(validator.socket_path.to_string_lossy().into_owned());

    let events = run_to_completion(&mut c).await;
    assert_eq!(final_status(&events), STATUS_ERR_VALIDATOR_TIMEOUT);
    assert!(!c.is_done());
    // one timeout status only
    let timeout_count = events
        .iter()
        .filter(|e| matches!(e, Event::Status(m) if *m == STATUS_ERR_VALIDATOR_TIMEOUT))
        .count();
    assert_eq!(timeout_count, 1);
    // the peer was restarted up to the retry budget
    assert!(
        validator.connection_count() >= 5,
        "connections {}",
        validator.connection_count()
    );
    // a plan proposal was emitted before the validator stalled
    assert!(events.iter().any(|e| matches!(e, Event::NewPlan(_))));
}
