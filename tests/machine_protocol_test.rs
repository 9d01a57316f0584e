//! Machine protocol behaviour over an in-memory pipe.

mod common;

use common::{fixture_db, make_controller};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use cfmuautoroute::controller::CommandIntake;
use cfmuautoroute::protocol::{Command, MachineInterface, TimestampMode};

#[tokio::test]
async fn test_setter_echo_and_cmdseq() {
    let (client, server) = tokio::io::duplex(1 << 20);
    let mut iface = MachineInterface::new(make_controller(fixture_db()), server, TimestampMode::Off);
    let mut lines = BufReader::new(client).lines();

    assert!(iface.dispatch("levels base=60 top=140 cmdseq=5").await.unwrap());
    let reply = Command::parse(&lines.next_line().await.unwrap().unwrap());
    assert_eq!(reply.name(), "levels");
    assert_eq!(reply.get("base"), Some("60"));
    assert_eq!(reply.get("top"), Some("140"));
    assert_eq!(reply.get("cmdseq"), Some("5"));
    assert_eq!(reply.get("error"), None);

    // swapped levels are normalised
    assert!(iface.dispatch("levels base=200 top=100").await.unwrap());
    let reply = Command::parse(&lines.next_line().await.unwrap().unwrap());
    assert_eq!(reply.get("base"), Some("100"));
    assert_eq!(reply.get("top"), Some("200"));
}

#[tokio::test]
async fn test_unknown_command_and_bad_airport() {
    let (client, server) = tokio::io::duplex(1 << 20);
    let mut iface = MachineInterface::new(make_controller(fixture_db()), server, TimestampMode::Off);
    let mut lines = BufReader::new(client).lines();

    assert!(iface.dispatch("frobnicate x=1").await.unwrap());
    let reply = Command::parse(&lines.next_line().await.unwrap().unwrap());
    assert!(reply.get("error").unwrap().contains("command not found"));

    assert!(iface.dispatch("departure icao=XXXX").await.unwrap());
    let reply = Command::parse(&lines.next_line().await.unwrap().unwrap());
    assert_eq!(reply.name(), "departure");
    assert!(reply.get("error").unwrap().contains("not found"));
}

#[tokio::test]
async fn test_atmosphere_clamping_and_optimization() {
    let (client, server) = tokio::io::duplex(1 << 20);
    let mut iface = MachineInterface::new(make_controller(fixture_db()), server, TimestampMode::Off);
    let mut lines = BufReader::new(client).lines();

    assert!(iface.dispatch("atmosphere qnh=2000 isa=15 wind=1").await.unwrap());
    let reply = Command::parse(&lines.next_line().await.unwrap().unwrap());
    assert_eq!(reply.get("qnh"), Some("1300"));
    assert_eq!(reply.get("isa"), Some("15"));
    assert_eq!(reply.get("wind"), Some("1"));

    assert!(iface.dispatch("optimization target=fuel").await.unwrap());
    let reply = Command::parse(&lines.next_line().await.unwrap().unwrap());
    assert_eq!(reply.get("target"), Some("fuel"));

    assert!(iface.dispatch("optimization target=bogus").await.unwrap());
    let reply = Command::parse(&lines.next_line().await.unwrap().unwrap());
    assert!(reply.get("error").is_some());
}

#[tokio::test]
async fn test_full_pogo_run_over_protocol() {
    let (client, server) = tokio::io::duplex(1 << 20);
    let mut iface =
        MachineInterface::new(make_controller(fixture_db()), server, TimestampMode::Off);

    let (tx, rx) = mpsc::channel(8);
    for cmd in [
        "departure icao=LFPG ifr",
        "destination icao=LFPO ifr",
        "start",
        "quit",
    ] {
        tx.send(cmd.to_string()).await.unwrap();
    }
    drop(tx);

    iface.run(CommandIntake::new(rx)).await.unwrap();
    drop(iface);

    let mut lines = Vec::new();
    let mut reader = BufReader::new(client).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        lines.push(line);
    }

    // greeting first
    let greeting = Command::parse(&lines[0]);
    assert_eq!(greeting.name(), "autoroute");
    assert!(greeting.get("version").is_some());
    assert_eq!(greeting.get("provider"), Some("cfmu"));

    // status lines for start and completion
    assert!(lines.iter().any(|l| {
        let c = Command::parse(l);
        c.name() == "autoroute" && c.get("status") == Some("starting")
    }));
    let stopping: Vec<Command> = lines
        .iter()
        .map(|l| Command::parse(l))
        .filter(|c| c.name() == "autoroute" && c.get("status") == Some("stopping"))
        .collect();
    assert!(!stopping.is_empty());
    assert_eq!(stopping.last().unwrap().get("routesuccess"), Some("1"));

    // the flight plan group is contiguous and ordered
    let begin = lines.iter().position(|l| l.starts_with("fplbegin")).unwrap();
    let end = lines.iter().position(|l| l.starts_with("fplend")).unwrap();
    assert!(begin < end);
    for line in &lines[begin + 1..end] {
        assert!(line.starts_with("fplwpt"), "unexpected line in group: {line}");
    }
    assert_eq!(end - begin - 1, 2, "POGO plan has exactly two waypoints");
    let fplend = Command::parse(&lines[end]);
    assert!(fplend.get("fpl").unwrap().contains("RMK/POGO"));
    assert!(fplend.get("gcdist").is_some());
    assert_eq!(fplend.get("localiteration"), Some("1"));
}
