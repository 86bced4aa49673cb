use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use heater_common::SwitchState;
use reqwest::{header::CONTENT_TYPE, Url};
use thiserror::Error;
use tokio::{net::UdpSocket, time::Instant};
use tracing::{debug, info, warn};

use crate::actuator::Switch;

pub const BASIC_EVENT_SERVICE: &str = "urn:Belkin:service:basicevent:1";
const SSDP_MULTICAST_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900));
const SEARCH_REPEATS: usize = 3;
const SEARCH_MX_SECS: u64 = 2;
const MAX_DATAGRAM_BYTES: usize = 2048;

#[derive(Debug, Error)]
pub enum WemoError {
    #[error("no wemo switch with serial {serial} answered within {timeout:?}")]
    NotFound { serial: String, timeout: Duration },
    #[error("ssdp socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wemo http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("device description is missing {0}")]
    Description(&'static str),
    #[error("invalid device url {0}")]
    Url(String),
    #[error("unexpected SOAP response: {0}")]
    Soap(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub friendly_name: String,
    pub serial_number: String,
    pub control_path: String,
}

#[derive(Debug, Clone)]
pub struct WemoSwitch {
    http: reqwest::Client,
    control_url: Url,
    description: DeviceDescription,
}

/// Searches the LAN for basicevent devices and keeps the first one whose
/// serial matches. Devices with other serials are skipped.
pub async fn discover(
    http: &reqwest::Client,
    serial: &str,
    timeout: Duration,
) -> Result<WemoSwitch, WemoError> {
    discover_at(http, serial, timeout, SSDP_MULTICAST_ADDR).await
}

/// Same as [`discover`], with the M-SEARCH sent to `target`.
pub async fn discover_at(
    http: &reqwest::Client,
    serial: &str,
    timeout: Duration,
    target: SocketAddr,
) -> Result<WemoSwitch, WemoError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let request = search_request(SEARCH_MX_SECS);
    for _ in 0..SEARCH_REPEATS {
        socket
            .send_to(request.as_bytes(), target)
            .await?;
    }
    debug!("ssdp search sent for {BASIC_EVENT_SERVICE}");

    let deadline = Instant::now() + timeout;
    let mut seen = HashSet::new();
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];

    loop {
        let (len, peer) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await
        {
            Ok(received) => received?,
            Err(_) => {
                return Err(WemoError::NotFound {
                    serial: serial.to_string(),
                    timeout,
                })
            }
        };

        let Some(location) = parse_search_response(&String::from_utf8_lossy(&buf[..len])) else {
            continue;
        };
        if !seen.insert(location.clone()) {
            continue;
        }

        match describe(http, &location).await {
            Ok(switch) if switch.serial_number() == serial => return Ok(switch),
            // Other switches on the LAN answer too; keep listening until the
            // deadline instead of failing on the first stranger.
            Ok(switch) => log_ignored(&switch, peer),
            Err(err) => warn!("failed to read wemo description at {location}: {err}"),
        }
    }
}

fn log_ignored(switch: &WemoSwitch, peer: SocketAddr) {
    info!(
        "ignoring wemo device {} ({}) at {peer}",
        switch.friendly_name(),
        switch.serial_number()
    );
}

/// Fetches `setup.xml` from a search response's location.
pub async fn describe(http: &reqwest::Client, location: &str) -> Result<WemoSwitch, WemoError> {
    let body = http
        .get(location)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let description = parse_device_description(&body)?;
    let control_url = Url::parse(location)
        .and_then(|base| base.join(&description.control_path))
        .map_err(|_| WemoError::Url(location.to_string()))?;

    Ok(WemoSwitch {
        http: http.clone(),
        control_url,
        description,
    })
}

impl WemoSwitch {
    pub fn friendly_name(&self) -> &str {
        &self.description.friendly_name
    }

    pub fn serial_number(&self) -> &str {
        &self.description.serial_number
    }

    /// Writes the state without reading it back: the device answers `Error`
    /// when asked for the state it is already in.
    pub async fn set_binary_state(&self, state: SwitchState) -> Result<(), WemoError> {
        let arguments = format!("<BinaryState>{}</BinaryState>", state.binary_value());
        self.soap_call("SetBinaryState", &arguments).await?;
        Ok(())
    }

    pub async fn get_binary_state(&self) -> Result<SwitchState, WemoError> {
        let body = self.soap_call("GetBinaryState", "").await?;
        parse_binary_state(&body)
    }

    async fn soap_call(&self, action: &str, arguments: &str) -> Result<String, WemoError> {
        let body = self
            .http
            .post(self.control_url.clone())
            .header(CONTENT_TYPE, "text/xml; charset=\"utf-8\"")
            .header("SOAPACTION", format!("\"{BASIC_EVENT_SERVICE}#{action}\""))
            .body(soap_envelope(action, arguments))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

impl Switch for WemoSwitch {
    fn name(&self) -> &str {
        self.friendly_name()
    }

    async fn set_state(&self, state: SwitchState) -> anyhow::Result<()> {
        Ok(self.set_binary_state(state).await?)
    }

    async fn current_state(&self) -> anyhow::Result<SwitchState> {
        Ok(self.get_binary_state().await?)
    }
}

pub fn search_request(mx_secs: u64) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {SSDP_MULTICAST_ADDR}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {mx_secs}\r\n\
         ST: {BASIC_EVENT_SERVICE}\r\n\
         \r\n"
    )
}

/// Returns the `LOCATION` of a successful search response for the basicevent
/// service. Responses for other search targets are ignored.
pub fn parse_search_response(raw: &str) -> Option<String> {
    let mut lines = raw.lines();
    let status = lines.next()?;
    if !status.starts_with("HTTP/1.1 200") {
        return None;
    }

    let mut location = None;
    let mut target_matches = true;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_uppercase().as_str() {
            "LOCATION" => location = Some(value.to_string()),
            "ST" => target_matches = value.eq_ignore_ascii_case(BASIC_EVENT_SERVICE),
            _ => {}
        }
    }

    location.filter(|_| target_matches)
}

pub fn parse_device_description(xml: &str) -> Result<DeviceDescription, WemoError> {
    let friendly_name = xml_text(xml, "friendlyName")
        .map(xml_unescape)
        .ok_or(WemoError::Description("friendlyName"))?;
    let serial_number = xml_text(xml, "serialNumber")
        .map(xml_unescape)
        .ok_or(WemoError::Description("serialNumber"))?;
    let control_path = xml
        .split("<service>")
        .skip(1)
        .find(|service| xml_text(service, "serviceType") == Some(BASIC_EVENT_SERVICE))
        .and_then(|service| xml_text(service, "controlURL"))
        .map(xml_unescape)
        .ok_or(WemoError::Description("basicevent controlURL"))?;

    Ok(DeviceDescription {
        friendly_name,
        serial_number,
        control_path,
    })
}

pub fn soap_envelope(action: &str, arguments: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body><u:{action} xmlns:u=\"{BASIC_EVENT_SERVICE}\">{arguments}</u:{action}></s:Body>\
         </s:Envelope>"
    )
}

/// Insight switches report `state|since|...`; only the leading field matters.
pub fn parse_binary_state(body: &str) -> Result<SwitchState, WemoError> {
    let value = xml_text(body, "BinaryState").ok_or_else(|| WemoError::Soap(body.to_string()))?;
    let leading = value.split('|').next().unwrap_or(value).trim();

    match leading.parse::<u8>() {
        Ok(0) => Ok(SwitchState::Off),
        Ok(_) => Ok(SwitchState::On),
        Err(_) => Err(WemoError::Soap(value.to_string())),
    }
}

fn xml_text<'a>(doc: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = doc.find(&open)? + open.len();
    let end = doc[start..].find(&close)? + start;
    Some(doc[start..end].trim())
}

fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        http::HeaderMap,
        routing::{get, post},
        Router,
    };
    use tokio::net::TcpListener;

    use super::*;

    const HEATER_SERIAL: &str = "221517K0101234";

    const SETUP_XML: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:Belkin:device-1-0">
  <device>
    <deviceType>urn:Belkin:device:controllee:1</deviceType>
    <friendlyName>Jordan&apos;s Heater</friendlyName>
    <serialNumber>221517K0101234</serialNumber>
    <serviceList>
      <service>
        <serviceType>urn:Belkin:service:WiFiSetup:1</serviceType>
        <controlURL>/upnp/control/WiFiSetup1</controlURL>
      </service>
      <service>
        <serviceType>urn:Belkin:service:basicevent:1</serviceType>
        <serviceId>urn:Belkin:serviceId:basicevent1</serviceId>
        <controlURL>/upnp/control/basicevent1</controlURL>
        <eventSubURL>/upnp/event/basicevent1</eventSubURL>
      </service>
    </serviceList>
  </device>
</root>"#;

    #[test]
    fn search_request_targets_basicevent() {
        let request = search_request(2);
        assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(request.contains("MAN: \"ssdp:discover\"\r\n"));
        assert!(request.contains("ST: urn:Belkin:service:basicevent:1\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn search_response_location_is_extracted() {
        let response = "HTTP/1.1 200 OK\r\n\
            CACHE-CONTROL: max-age=86400\r\n\
            Location: http://192.168.1.42:49153/setup.xml\r\n\
            SERVER: Unspecified, UPnP/1.0, Unspecified\r\n\
            ST: urn:Belkin:service:basicevent:1\r\n\
            USN: uuid:Socket-1_0-221517K0101234::urn:Belkin:service:basicevent:1\r\n\r\n";

        assert_eq!(
            parse_search_response(response).as_deref(),
            Some("http://192.168.1.42:49153/setup.xml")
        );
    }

    #[test]
    fn foreign_search_responses_are_ignored() {
        let other_target = "HTTP/1.1 200 OK\r\nLOCATION: http://10.0.0.2/desc.xml\r\nST: upnp:rootdevice\r\n\r\n";
        assert_eq!(parse_search_response(other_target), None);

        let notify = "NOTIFY * HTTP/1.1\r\nLOCATION: http://10.0.0.2/desc.xml\r\n\r\n";
        assert_eq!(parse_search_response(notify), None);

        let no_location = "HTTP/1.1 200 OK\r\nST: urn:Belkin:service:basicevent:1\r\n\r\n";
        assert_eq!(parse_search_response(no_location), None);
    }

    #[test]
    fn device_description_picks_basicevent_control_url() {
        let description = parse_device_description(SETUP_XML).unwrap();
        assert_eq!(
            description,
            DeviceDescription {
                friendly_name: "Jordan's Heater".to_string(),
                serial_number: "221517K0101234".to_string(),
                control_path: "/upnp/control/basicevent1".to_string(),
            }
        );
    }

    #[test]
    fn device_description_without_serial_is_rejected() {
        let xml = SETUP_XML.replace("<serialNumber>221517K0101234</serialNumber>", "");
        assert!(matches!(
            parse_device_description(&xml),
            Err(WemoError::Description("serialNumber"))
        ));
    }

    #[test]
    fn binary_state_parsing() {
        let on = "<s:Envelope><s:Body><u:GetBinaryStateResponse><BinaryState>1</BinaryState></u:GetBinaryStateResponse></s:Body></s:Envelope>";
        let off = on.replace(">1<", ">0<");
        let insight = on.replace(">1<", ">8|1704436200|0|0<");
        let error = on.replace(">1<", ">Error<");

        assert_eq!(parse_binary_state(on).unwrap(), SwitchState::On);
        assert_eq!(parse_binary_state(&off).unwrap(), SwitchState::Off);
        assert_eq!(parse_binary_state(&insight).unwrap(), SwitchState::On);
        assert!(matches!(parse_binary_state(&error), Err(WemoError::Soap(_))));
        assert!(matches!(parse_binary_state("<html/>"), Err(WemoError::Soap(_))));
    }

    #[test]
    fn soap_envelope_wraps_action() {
        let envelope = soap_envelope("SetBinaryState", "<BinaryState>0</BinaryState>");
        assert!(envelope.contains(
            "<u:SetBinaryState xmlns:u=\"urn:Belkin:service:basicevent:1\"><BinaryState>0</BinaryState></u:SetBinaryState>"
        ));
    }

    #[tokio::test]
    async fn describe_and_switch_against_local_device() {
        let requests: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let captured = requests.clone();

        let app = Router::new()
            .route("/setup.xml", get(|| async { SETUP_XML }))
            .route(
                "/upnp/control/basicevent1",
                post(move |headers: HeaderMap, body: String| {
                    let captured = captured.clone();
                    async move {
                        let action = headers
                            .get("soapaction")
                            .and_then(|value| value.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        captured.lock().unwrap().push((action, body));
                        "<s:Envelope><s:Body><u:GetBinaryStateResponse><BinaryState>0</BinaryState></u:GetBinaryStateResponse></s:Body></s:Envelope>"
                    }
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let http = reqwest::Client::new();
        let switch = describe(&http, &format!("http://{addr}/setup.xml"))
            .await
            .unwrap();
        assert_eq!(switch.serial_number(), "221517K0101234");
        assert_eq!(switch.name(), "Jordan's Heater");

        switch.set_binary_state(SwitchState::On).await.unwrap();
        assert_eq!(switch.get_binary_state().await.unwrap(), SwitchState::Off);

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0].0,
            "\"urn:Belkin:service:basicevent:1#SetBinaryState\""
        );
        assert!(requests[0].1.contains("<BinaryState>1</BinaryState>"));
        assert_eq!(
            requests[1].0,
            "\"urn:Belkin:service:basicevent:1#GetBinaryState\""
        );
    }

    fn search_response(location: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\n\
             LOCATION: {location}\r\n\
             ST: {BASIC_EVENT_SERVICE}\r\n\r\n"
        )
    }

    /// Serves the heater at `/setup.xml` and a lamp at `/lamp/setup.xml`.
    async fn spawn_descriptions() -> SocketAddr {
        let lamp = SETUP_XML
            .replace(HEATER_SERIAL, "221517K0105678")
            .replace("Jordan&apos;s Heater", "Desk Lamp");
        let app = Router::new()
            .route("/setup.xml", get(|| async { SETUP_XML }))
            .route("/lamp/setup.xml", get(move || async move { lamp }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    /// Answers every M-SEARCH with one datagram per location, in order.
    async fn spawn_responder(locations: Vec<String>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM_BYTES];
            while let Ok((_, peer)) = socket.recv_from(&mut buf).await {
                for location in &locations {
                    let _ = socket
                        .send_to(search_response(location).as_bytes(), peer)
                        .await;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn discovery_skips_other_serials_and_returns_match() {
        let http_addr = spawn_descriptions().await;
        let responder = spawn_responder(vec![
            format!("http://{http_addr}/lamp/setup.xml"),
            format!("http://{http_addr}/setup.xml"),
        ])
        .await;

        let switch = discover_at(
            &reqwest::Client::new(),
            HEATER_SERIAL,
            Duration::from_secs(5),
            responder,
        )
        .await
        .unwrap();

        assert_eq!(switch.serial_number(), HEATER_SERIAL);
        assert_eq!(switch.friendly_name(), "Jordan's Heater");
    }

    #[tokio::test]
    async fn discovery_without_match_ends_in_not_found() {
        let http_addr = spawn_descriptions().await;
        let responder = spawn_responder(vec![format!("http://{http_addr}/lamp/setup.xml")]).await;

        let err = discover_at(
            &reqwest::Client::new(),
            HEATER_SERIAL,
            Duration::from_millis(300),
            responder,
        )
        .await
        .unwrap_err();

        assert!(
            matches!(err, WemoError::NotFound { ref serial, .. } if serial == HEATER_SERIAL),
            "{err}"
        );
    }
}
