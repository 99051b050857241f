//! Client-side handlers per device capability.
//!
//! When a Block identifies a newly-discovered peer it attaches the handler
//! matching the peer's device type. The handler set is a closed enum — one
//! variant per capability group rather than open-ended subclassing — so
//! dispatch stays exhaustive. Handlers watch value updates and state-word
//! changes on their connection and keep a digested view (position, exposure
//! activity, work-queue depth) for whoever drives the Block.

use skyproto::state::{BOP_EXPOSURE, BOP_TEL_MOVE};
use skyproto::{DeviceType, ValueData};

use crate::connection::Connection;

/// Hooks a handler receives from the reactor sweep.
pub trait PeerEvents {
    /// The peer finished its handshake.
    fn connected(&mut self, _conn: &Connection) {}
    /// A value on the peer changed.
    fn value_changed(&mut self, _conn: &Connection, _name: &str) {}
    /// The peer's state word changed.
    fn state_changed(&mut self, _conn: &Connection, _old: u32, _new: u32) {}
}

/// Pointing hardware: telescope, dome, cupola, mirror.
#[derive(Debug, Default)]
pub struct PointingClient {
    position: Option<(f64, f64)>,
    moving: bool,
}

impl PointingClient {
    pub fn position(&self) -> Option<(f64, f64)> {
        self.position
    }

    pub fn is_moving(&self) -> bool {
        self.moving
    }
}

impl PeerEvents for PointingClient {
    fn value_changed(&mut self, conn: &Connection, name: &str) {
        if let Some(entry) = conn.values().get(name) {
            if let ValueData::RaDec { ra, dec } = entry.data {
                self.position = Some((ra, dec));
            }
        }
    }

    fn state_changed(&mut self, _conn: &Connection, _old: u32, new: u32) {
        self.moving = new & BOP_TEL_MOVE != 0;
    }
}

/// Detectors: camera, photometer.
#[derive(Debug, Default)]
pub struct ImagingClient {
    exposing: bool,
    exposures_started: u64,
}

impl ImagingClient {
    pub fn is_exposing(&self) -> bool {
        self.exposing
    }

    pub fn exposures_started(&self) -> u64 {
        self.exposures_started
    }
}

impl PeerEvents for ImagingClient {
    fn state_changed(&mut self, _conn: &Connection, old: u32, new: u32) {
        let was = old & BOP_EXPOSURE != 0;
        let is = new & BOP_EXPOSURE != 0;
        if !was && is {
            self.exposures_started += 1;
        }
        self.exposing = is;
    }
}

/// Small adjusters safe to drive mid-exposure: filter wheel, focuser.
#[derive(Debug, Default)]
pub struct AdjusterClient {
    last_setting: Option<(String, ValueData)>,
}

impl AdjusterClient {
    pub fn last_setting(&self) -> Option<(&str, &ValueData)> {
        self.last_setting.as_ref().map(|(n, d)| (n.as_str(), d))
    }
}

impl PeerEvents for AdjusterClient {
    fn value_changed(&mut self, conn: &Connection, name: &str) {
        if let Some(entry) = conn.values().get(name) {
            self.last_setting = Some((name.to_string(), entry.data.clone()));
        }
    }
}

/// Work-routing peers: executor, image processor, selector, GRB receiver.
#[derive(Debug, Default)]
pub struct PipelineClient {
    queue_depth: Option<f64>,
}

impl PipelineClient {
    pub fn queue_depth(&self) -> Option<f64> {
        self.queue_depth
    }
}

impl PeerEvents for PipelineClient {
    fn value_changed(&mut self, conn: &Connection, name: &str) {
        if name == "que_size" {
            self.queue_depth = conn.values().numeric(name);
        }
    }
}

/// Anything we have no specialized view for.
#[derive(Debug, Default)]
pub struct GenericClient;

impl PeerEvents for GenericClient {}

/// The closed handler set, one variant per capability.
#[derive(Debug)]
pub enum DeviceHandler {
    Pointing(PointingClient),
    Imaging(ImagingClient),
    Adjuster(AdjusterClient),
    Pipeline(PipelineClient),
    Generic(GenericClient),
}

impl DeviceHandler {
    /// The capability-appropriate handler for a newly identified peer.
    pub fn for_type(ty: DeviceType) -> Self {
        match ty {
            DeviceType::Telescope | DeviceType::Dome | DeviceType::Cupola | DeviceType::Mirror => {
                DeviceHandler::Pointing(PointingClient::default())
            }
            DeviceType::Camera | DeviceType::Photometer => {
                DeviceHandler::Imaging(ImagingClient::default())
            }
            DeviceType::FilterWheel | DeviceType::Focuser => {
                DeviceHandler::Adjuster(AdjusterClient::default())
            }
            DeviceType::Executor
            | DeviceType::ImageProcessor
            | DeviceType::Selector
            | DeviceType::GrbReceiver => DeviceHandler::Pipeline(PipelineClient::default()),
            DeviceType::Generic => DeviceHandler::Generic(GenericClient),
        }
    }

    fn inner(&mut self) -> &mut dyn PeerEvents {
        match self {
            DeviceHandler::Pointing(h) => h,
            DeviceHandler::Imaging(h) => h,
            DeviceHandler::Adjuster(h) => h,
            DeviceHandler::Pipeline(h) => h,
            DeviceHandler::Generic(h) => h,
        }
    }

    pub fn connected(&mut self, conn: &Connection) {
        self.inner().connected(conn);
    }

    pub fn value_changed(&mut self, conn: &Connection, name: &str) {
        self.inner().value_changed(conn, name);
    }

    pub fn state_changed(&mut self, conn: &Connection, old: u32, new: u32) {
        self.inner().state_changed(conn, old, new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use skyproto::{TypeWord, ValueKind};

    use crate::ConnId;

    fn camera_conn() -> Connection {
        let mut c = Connection::accepted(ConnId(1), Instant::now());
        c.identify_device("C0", DeviceType::Camera, "localhost", 5554);
        c
    }

    #[test]
    fn factory_matches_capabilities() {
        assert!(matches!(
            DeviceHandler::for_type(DeviceType::Telescope),
            DeviceHandler::Pointing(_)
        ));
        assert!(matches!(
            DeviceHandler::for_type(DeviceType::Camera),
            DeviceHandler::Imaging(_)
        ));
        assert!(matches!(
            DeviceHandler::for_type(DeviceType::Focuser),
            DeviceHandler::Adjuster(_)
        ));
        assert!(matches!(
            DeviceHandler::for_type(DeviceType::ImageProcessor),
            DeviceHandler::Pipeline(_)
        ));
        assert!(matches!(
            DeviceHandler::for_type(DeviceType::Generic),
            DeviceHandler::Generic(_)
        ));
    }

    #[test]
    fn imaging_counts_exposure_edges() {
        let conn = camera_conn();
        let mut handler = DeviceHandler::for_type(DeviceType::Camera);

        handler.state_changed(&conn, 0, BOP_EXPOSURE);
        handler.state_changed(&conn, BOP_EXPOSURE, BOP_EXPOSURE);
        handler.state_changed(&conn, BOP_EXPOSURE, 0);
        handler.state_changed(&conn, 0, BOP_EXPOSURE);

        let DeviceHandler::Imaging(imaging) = handler else { panic!() };
        assert_eq!(imaging.exposures_started(), 2);
        assert!(imaging.is_exposing());
    }

    #[test]
    fn pointing_tracks_position_value() {
        let mut conn = Connection::accepted(ConnId(2), Instant::now());
        conn.identify_device("T0", DeviceType::Telescope, "localhost", 5553);
        conn.values_mut()
            .declare(TypeWord::new(ValueKind::RaDec), "tel", "current pointing")
            .unwrap();
        conn.values_mut()
            .set("tel", ValueData::RaDec { ra: 83.6, dec: 22.0 })
            .unwrap();

        let mut handler = DeviceHandler::for_type(DeviceType::Telescope);
        handler.value_changed(&conn, "tel");
        handler.state_changed(&conn, 0, BOP_TEL_MOVE);

        let DeviceHandler::Pointing(pointing) = handler else { panic!() };
        assert_eq!(pointing.position(), Some((83.6, 22.0)));
        assert!(pointing.is_moving());
    }
}
