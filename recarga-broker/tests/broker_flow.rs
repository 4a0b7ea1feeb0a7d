//! Broker behaviour over real loopback connections

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use recarga_broker::{Broker, BrokerConfig, Dispatcher, MemoryHistory};
use recarga_core::{
    split_stream, AvailabilityReport, CoverageArea, Message, MessageKind, MessageReader, Origin,
    PointLocation, Region, SharedWriter,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

struct Client {
    reader: MessageReader<OwnedReadHalf>,
    writer: Arc<SharedWriter<OwnedWriteHalf>>,
    origin: Origin,
}

impl Client {
    async fn connect(addr: SocketAddr, origin: Origin) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = split_stream(stream);
        Self {
            reader,
            writer: Arc::new(writer),
            origin,
        }
    }

    async fn send(&self, kind: MessageKind, content: &str) {
        self.writer
            .send_message(&Message::new(kind, content, self.origin))
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Option<Message> {
        tokio::time::timeout(Duration::from_secs(10), self.reader.next_message())
            .await
            .expect("no message in time")
            .unwrap()
    }

    async fn recv_kind(&mut self, kind: MessageKind) -> Message {
        loop {
            let msg = self.recv().await.expect("broker closed the connection");
            if msg.kind == kind {
                return msg;
            }
        }
    }
}

fn region() -> Region {
    let area = CoverageArea {
        latitude_min: -1.0,
        latitude_max: 1.0,
        longitude_min: -1.0,
        longitude_max: 1.0,
    };
    let points = vec![
        PointLocation { id: 1, latitude: 0.0045, longitude: 0.0 },
        PointLocation { id: 2, latitude: 0.009, longitude: 0.0 },
        PointLocation { id: 3, latitude: 0.5, longitude: 0.5 },
    ];
    Region::new(area, points).unwrap()
}

async fn start_broker() -> (SocketAddr, Arc<Dispatcher>) {
    let config = BrokerConfig::new("127.0.0.1:0".parse().unwrap())
        .with_poll_timeout(Duration::from_millis(500))
        .with_ranking_timeouts(Duration::from_millis(500), Duration::from_secs(1));
    let bound = Broker::new(config, region(), Arc::new(MemoryHistory::new()))
        .bind()
        .await
        .unwrap();
    let addr = bound.local_addr();
    let dispatcher = bound.dispatcher().clone();
    tokio::spawn(bound.run());
    (addr, dispatcher)
}

/// A point that answers every availability probe with a fixed queue length
async fn fake_point(addr: SocketAddr, dispatcher: &Dispatcher, queue: usize) -> tokio::task::JoinHandle<()> {
    let before = dispatcher.registry().all_points().len();
    let mut point = Client::connect(addr, Origin::ChargingPoint).await;
    point.send(MessageKind::Identify, "charging point online").await;

    let handle = tokio::spawn(async move {
        let report = AvailabilityReport::new(None, queue).to_payload().unwrap();
        while let Ok(Some(msg)) = point.reader.next_message().await {
            if msg.kind == MessageKind::GetAvailability {
                point.send(MessageKind::Availability, &report).await;
            }
        }
    });

    wait_until(|| dispatcher.registry().all_points().len() > before).await;
    handle
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn ranking_for(addr: SocketAddr, plate: &str) -> (Client, String) {
    let mut vehicle = Client::connect(addr, Origin::Vehicle).await;
    vehicle.send(MessageKind::Identify, plate).await;
    vehicle.send(MessageKind::RequestCharge, "").await;
    vehicle.recv_kind(MessageKind::RegionData).await;
    vehicle.send(MessageKind::Location, "0.0,0.0").await;
    let ranking = vehicle.recv_kind(MessageKind::Ranking).await;
    (vehicle, ranking.content)
}

#[tokio::test]
async fn test_empty_point_outranks_congested_neighbour() {
    let (addr, dispatcher) = start_broker().await;
    let _near = fake_point(addr, &dispatcher, 3).await;
    let _far = fake_point(addr, &dispatcher, 0).await;

    let (_vehicle, ranking) = ranking_for(addr, "ABC1234").await;
    let lines: Vec<&str> = ranking.lines().collect();

    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("1. Point ID: 2,"), "{}", ranking);
    assert!(lines[0].ends_with("Queue: 0 vehicles"));
    assert!(lines[1].starts_with("2. Point ID: 1,"));
    assert!(lines[1].ends_with("Queue: 3 vehicles"));
    // point 3 never connected
    assert!(lines[2].starts_with("3. Point ID: 3,"));
}

#[tokio::test]
async fn test_duplicate_plate_refused_across_connections() {
    let (addr, dispatcher) = start_broker().await;

    let first = Client::connect(addr, Origin::Vehicle).await;
    first.send(MessageKind::Identify, "DUP1234").await;
    wait_until(|| dispatcher.registry().lookup_by_plate("DUP1234").is_some()).await;

    let mut second = Client::connect(addr, Origin::Vehicle).await;
    second.send(MessageKind::CheckPlate, "DUP1234").await;
    let reply = second.recv_kind(MessageKind::PlateUnavailable).await;
    assert!(reply.content.contains("already in use"));

    // the plate is free again once its owner leaves
    drop(first);
    wait_until(|| dispatcher.registry().lookup_by_plate("DUP1234").is_none()).await;
    second.send(MessageKind::CheckPlate, "DUP1234").await;
    second.recv_kind(MessageKind::PlateAvailable).await;
}

#[tokio::test]
async fn test_reservation_reaches_point_and_is_confirmed() {
    let (addr, dispatcher) = start_broker().await;

    let mut point = Client::connect(addr, Origin::ChargingPoint).await;
    point.send(MessageKind::Identify, "charging point online").await;
    point.recv_kind(MessageKind::GetAvailability).await;
    let idle = AvailabilityReport::new(None, 0).to_payload().unwrap();
    point.send(MessageKind::Availability, &idle).await;
    wait_until(|| dispatcher.registry().known_queue(1).is_some()).await;

    let (mut vehicle, ranking) = {
        let ranked = ranking_for(addr, "RES4321");
        let answering = async {
            point.recv_kind(MessageKind::GetAvailability).await;
            point.send(MessageKind::Availability, &idle).await;
        };
        let (ranked, _) = tokio::join!(ranked, answering);
        ranked
    };
    assert!(ranking.starts_with("1. Point ID: 1,"));

    vehicle.send(MessageKind::RequestReservation, "1").await;
    let request = point.recv_kind(MessageKind::NewRequest).await;
    assert_eq!(request.content, "RES4321");

    point.recv_kind(MessageKind::GetAvailability).await;
    let one = AvailabilityReport::new(None, 1).to_payload().unwrap();
    point.send(MessageKind::Availability, &one).await;

    let confirmation = vehicle.recv_kind(MessageKind::ReservationConfirmed).await;
    assert!(confirmation.content.contains("You are next in line"));
    let reservation = dispatcher.reservations().get("RES4321").unwrap();
    assert_eq!(reservation.point_id, 1);

    // losing the point cancels the reservation
    drop(point);
    let notice = vehicle.recv_kind(MessageKind::ReservationFailed).await;
    assert!(notice.content.contains("disconnected"));
    assert!(dispatcher.reservations().get("RES4321").is_none());
    wait_until(|| dispatcher.registry().lookup_by_point(1).is_none()).await;
}

#[tokio::test]
async fn test_reservation_at_unconnected_point_fails() {
    let (addr, _dispatcher) = start_broker().await;

    let (mut vehicle, _) = ranking_for(addr, "NOP5555").await;
    vehicle.send(MessageKind::RequestReservation, "2").await;
    let reply = vehicle.recv_kind(MessageKind::ReservationFailed).await;
    assert!(reply.content.contains("not found"));
}
