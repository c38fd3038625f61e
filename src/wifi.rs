//! ESP-IDF radio: station association, the config portal access point with
//! its HTTP form, and mDNS hostname advertisement.

use crate::network_config::NetworkCredential;
use crate::provisioning::{
    portal_channel, Association, PortalInbox, PortalOutbox, PortalSubmission, Radio, RadioError,
    RadioMode, StationEvent, StationLink, PORTAL_PAGE,
};
use anyhow::Result;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::{EspSubscription, EspSystemEventLoop, System};
use esp_idf_svc::http::server::{Configuration as HttpConfiguration, EspHttpServer};
use esp_idf_svc::http::Method;
use esp_idf_svc::io::{Read, Write};
use esp_idf_svc::mdns::EspMdns;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::sys::EspError;
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi, WifiEvent,
};
use log::info;

const MAX_FORM_LEN: usize = 512;

fn driver(e: EspError) -> RadioError {
    RadioError::Driver(e.to_string())
}

pub struct EspRadio {
    wifi: EspWifi<'static>,
    _events: EspSubscription<'static, System>,
    link: StationLink,
    portal: Option<EspHttpServer<'static>>,
    outbox: PortalOutbox,
    inbox: PortalInbox,
    mdns: Option<EspMdns>,
    mode: RadioMode,
}

impl EspRadio {
    pub fn new(modem: Modem, sysloop: EspSystemEventLoop, nvs: EspDefaultNvsPartition) -> Result<Self> {
        info!("🌐 WiFi: Creating EspWifi instance...");
        let wifi = EspWifi::new(modem, sysloop.clone(), Some(nvs))?;

        let link = StationLink::new();
        let events_link = link.clone();
        let events = sysloop.subscribe::<WifiEvent, _>(move |event| {
            let event = match event {
                WifiEvent::StaStarted => StationEvent::Started,
                WifiEvent::StaStopped => StationEvent::Stopped,
                WifiEvent::StaDisconnected { .. } => StationEvent::Disconnected,
                _ => return,
            };
            events_link.on_event(event);
        })?;

        let (outbox, inbox) = portal_channel();
        info!("✅ WiFi: EspWifi created");

        Ok(Self {
            wifi,
            _events: events,
            link,
            portal: None,
            outbox,
            inbox,
            mdns: None,
            mode: RadioMode::Off,
        })
    }

    fn start_portal_server(&mut self) -> Result<(), EspError> {
        let mut server = EspHttpServer::new(&HttpConfiguration::default())?;

        server.fn_handler("/", Method::Get, |req| {
            req.into_ok_response()?.write_all(PORTAL_PAGE.as_bytes())
        })?;

        let outbox = self.outbox.clone();
        server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
            let mut body = [0u8; MAX_FORM_LEN];
            let mut len = 0;
            while len < body.len() {
                let n = req.read(&mut body[len..])?;
                if n == 0 {
                    break;
                }
                len += n;
            }

            match outbox.submit(&body[..len]) {
                Ok(()) => {
                    req.into_ok_response()?
                        .write_all(b"Saved. The meter is now joining your network.")?;
                }
                Err(e) => {
                    log::warn!("Portal: Rejected submission: {}", e);
                    req.into_status_response(400)?
                        .write_all(e.to_string().as_bytes())?;
                }
            }
            Ok(())
        })?;

        self.portal = Some(server);
        Ok(())
    }
}

impl Radio for EspRadio {
    fn start_access_point(&mut self, ssid: &str, passphrase: &str) -> Result<(), RadioError> {
        if self.mode != RadioMode::Off {
            return Err(RadioError::Busy);
        }

        let mut ap = AccessPointConfiguration {
            auth_method: AuthMethod::WPA2Personal,
            channel: 1,
            ..Default::default()
        };
        ap.ssid
            .push_str(ssid)
            .map_err(|_| RadioError::Driver("AP SSID too long".into()))?;
        ap.password
            .push_str(passphrase)
            .map_err(|_| RadioError::Driver("AP password too long".into()))?;

        info!("📡 WiFi: Starting access point '{}'...", ssid);
        self.wifi
            .set_configuration(&Configuration::AccessPoint(ap))
            .map_err(driver)?;
        self.wifi.start().map_err(driver)?;

        self.inbox.clear();
        if let Err(e) = self.start_portal_server() {
            let _ = self.wifi.stop();
            return Err(driver(e));
        }

        self.mode = RadioMode::AccessPoint;
        info!("✅ WiFi: Config portal at http://192.168.71.1/");
        Ok(())
    }

    fn start_station(&mut self, credential: &NetworkCredential) -> Result<(), RadioError> {
        if self.mode == RadioMode::AccessPoint {
            return Err(RadioError::Busy);
        }

        self.link.begin_attempt();
        // A restart goes through a full stop so the new attempt gets its own StaStarted
        if self.wifi.is_started().map_err(driver)? {
            self.wifi.stop().map_err(driver)?;
        }
        self.mode = RadioMode::Off;

        let config = Configuration::Client(ClientConfiguration {
            ssid: credential.ssid.clone(),
            password: credential.passphrase.clone(),
            auth_method: AuthMethod::WPA2Personal,
            ..Default::default()
        });
        self.wifi.set_configuration(&config).map_err(driver)?;
        self.wifi.start().map_err(driver)?;
        self.wifi.connect().map_err(driver)?;
        self.mode = RadioMode::Station;
        Ok(())
    }

    fn association(&mut self) -> Association {
        if self.mode != RadioMode::Station {
            return Association::Idle;
        }
        let connected = self.wifi.is_connected().unwrap_or(false);
        let up = self.wifi.sta_netif().is_up().unwrap_or(false);

        if connected && up {
            Association::Connected
        } else if self.link.dropped() {
            Association::Failed
        } else {
            Association::Connecting
        }
    }

    fn stop(&mut self) -> Result<(), RadioError> {
        self.portal = None;
        if self.wifi.is_started().map_err(driver)? {
            info!("🔌 WiFi: Stopping radio");
            self.wifi.stop().map_err(driver)?;
        }
        self.mode = RadioMode::Off;
        Ok(())
    }

    fn poll_submission(&mut self) -> Option<PortalSubmission> {
        if self.mode == RadioMode::AccessPoint {
            self.inbox.try_take()
        } else {
            None
        }
    }

    fn advertise(&mut self, hostname: &str) -> Result<(), RadioError> {
        if let Ok(ip) = self.wifi.sta_netif().get_ip_info() {
            info!("🌐 WiFi: IP address: {}", ip.ip);
        }
        if self.mdns.is_none() {
            let mut mdns = EspMdns::take().map_err(driver)?;
            mdns.set_hostname(hostname).map_err(driver)?;
            mdns.set_instance_name(hostname).map_err(driver)?;
            self.mdns = Some(mdns);
        }
        Ok(())
    }
}
