//! Docker remote network driver messages
//!
//! Field names follow the libnetwork remote driver API (PascalCase JSON).

use crate::error::{Error, Result};
use crate::hw::MacAddress;
use crate::sriov::{EndpointInfo, EndpointInterface, EndpointRequest, JoinInfo, NetworkOptions};
use ipnet::IpNet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;

/// Option namespace carrying `-o key=value` driver options
pub const GENERIC_OPTIONS: &str = "com.docker.network.generic";

/// Content type of every plugin response
pub const CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1+json";

/// Decode a request body
///
/// Docker sends an empty body for parameterless calls.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::from_slice(b"{}")?);
    }
    Ok(serde_json::from_slice(body)?)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActivateResponse {
    pub implements: Vec<String>,
}

impl ActivateResponse {
    pub fn network_driver() -> Self {
        Self {
            implements: vec!["NetworkDriver".to_string()],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitiesResponse {
    pub scope: String,
    pub connectivity_scope: String,
}

impl Default for CapabilitiesResponse {
    fn default() -> Self {
        Self {
            scope: "local".to_string(),
            connectivity_scope: "local".to_string(),
        }
    }
}

/// Empty success answer
#[derive(Debug, Default, Serialize)]
pub struct Empty {}

/// Error answer
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "Err")]
    pub err: String,
}

/// IPAM data of one address family
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IpamData {
    pub address_space: String,
    pub pool: String,
    pub gateway: String,
    pub aux_addresses: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CreateNetworkRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    pub options: HashMap<String, Value>,
    #[serde(rename = "IPv4Data")]
    pub ipv4_data: Vec<IpamData>,
    #[serde(rename = "IPv6Data")]
    pub ipv6_data: Vec<IpamData>,
}

impl CreateNetworkRequest {
    /// Driver options given with `-o`
    ///
    /// Non-string values are stringified so `vlan=100` and `vlan: 100` both
    /// parse.
    pub fn network_options(&self) -> NetworkOptions {
        let map: HashMap<String, String> = self
            .options
            .get(GENERIC_OPTIONS)
            .and_then(Value::as_object)
            .map(|generic| {
                generic
                    .iter()
                    .filter_map(|(k, v)| {
                        let v = match v {
                            Value::String(s) => s.clone(),
                            Value::Number(n) => n.to_string(),
                            Value::Bool(b) => b.to_string(),
                            _ => return None,
                        };
                        Some((k.clone(), v))
                    })
                    .collect()
            })
            .unwrap_or_default();
        NetworkOptions::from_map(&map)
    }

    /// Gateway of the first IPv4 pool, checked to be an address
    pub fn gateway(&self) -> Result<Option<String>> {
        let Some(gateway) = self
            .ipv4_data
            .first()
            .map(|d| d.gateway.trim())
            .filter(|g| !g.is_empty())
        else {
            return Ok(None);
        };

        if gateway.parse::<IpNet>().is_err() && gateway.parse::<IpAddr>().is_err() {
            return Err(Error::Protocol(format!("invalid gateway '{}'", gateway)));
        }
        Ok(Some(gateway.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
}

/// Interface part of a create-endpoint request
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct InterfaceRequest {
    pub address: String,
    #[serde(rename = "AddressIPv6")]
    pub address_ipv6: String,
    pub mac_address: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CreateEndpointRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    pub interface: Option<InterfaceRequest>,
    pub options: HashMap<String, Value>,
}

impl CreateEndpointRequest {
    /// Requested addressing, empty strings meaning "not requested"
    pub fn endpoint_request(&self) -> Result<EndpointRequest> {
        let Some(iface) = &self.interface else {
            return Ok(EndpointRequest::default());
        };
        let non_empty = |s: &str| Some(s.trim().to_string()).filter(|s| !s.is_empty());

        let mac = match non_empty(&iface.mac_address) {
            Some(mac) => Some(mac.parse::<MacAddress>()?),
            None => None,
        };
        Ok(EndpointRequest {
            address: non_empty(&iface.address),
            address_ipv6: non_empty(&iface.address_ipv6),
            mac,
        })
    }
}

/// Interface part of a create-endpoint answer
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateEndpointResponse {
    pub interface: InterfaceResponse,
}

impl From<EndpointInterface> for CreateEndpointResponse {
    fn from(iface: EndpointInterface) -> Self {
        Self {
            interface: InterfaceResponse {
                address: iface.address,
                mac_address: iface.mac_address,
            },
        }
    }
}

/// Request naming an endpoint (delete, info, join, leave)
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EndpointRef {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InfoResponse {
    pub value: HashMap<String, String>,
}

impl From<EndpointInfo> for InfoResponse {
    fn from(info: EndpointInfo) -> Self {
        let mut value = HashMap::new();
        value.insert("pf".to_string(), info.pf);
        value.insert("vlan".to_string(), info.vlan.to_string());
        value.insert("vf".to_string(), info.vf_index.to_string());
        value.insert("netdev".to_string(), info.netdev);
        if let Some(mac) = info.mac {
            value.insert("mac".to_string(), mac.to_string());
        }
        if let Some(pci) = info.pci_address {
            value.insert("pci".to_string(), pci);
        }
        Self { value }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceName {
    pub src_name: String,
    pub dst_prefix: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinResponse {
    pub interface_name: InterfaceName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    pub disable_gateway_service: bool,
}

impl From<JoinInfo> for JoinResponse {
    fn from(info: JoinInfo) -> Self {
        Self {
            interface_name: InterfaceName {
                src_name: info.src_name,
                dst_prefix: info.dst_prefix,
            },
            gateway: info.gateway,
            disable_gateway_service: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_empty_body() {
        let req: NetworkRequest = decode(b"").unwrap();
        assert!(req.network_id.is_empty());
    }

    #[test]
    fn test_decode_malformed_body() {
        assert!(matches!(decode::<NetworkRequest>(b"{nope"), Err(Error::Json(_))));
    }

    #[test]
    fn test_create_network_request() {
        let body = json!({
            "NetworkID": "n1",
            "Options": {
                "com.docker.network.enable_ipv6": false,
                "com.docker.network.generic": {
                    "netdevice": "eth10",
                    "vlan": 100,
                    "privileged": "1"
                }
            },
            "IPv4Data": [{
                "AddressSpace": "LocalDefault",
                "Pool": "10.9.0.0/24",
                "Gateway": "10.9.0.1/24"
            }],
            "IPv6Data": []
        });

        let req: CreateNetworkRequest = decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(req.network_id, "n1");

        let opts = req.network_options();
        assert_eq!(opts.device.as_deref(), Some("eth10"));
        assert_eq!(opts.vlan.as_deref(), Some("100"));
        assert_eq!(opts.privileged.as_deref(), Some("1"));
        assert_eq!(req.gateway().unwrap().as_deref(), Some("10.9.0.1/24"));
    }

    #[test]
    fn test_create_network_without_generic_options() {
        let req: CreateNetworkRequest = decode(br#"{"NetworkID":"n1"}"#).unwrap();
        assert_eq!(req.network_options(), NetworkOptions::default());
        assert_eq!(req.gateway().unwrap(), None);
    }

    #[test]
    fn test_invalid_gateway() {
        let body = br#"{"NetworkID":"n1","IPv4Data":[{"Gateway":"not-an-ip"}]}"#;
        let req: CreateNetworkRequest = decode(body).unwrap();
        assert!(matches!(req.gateway(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_create_endpoint_request() {
        let body = br#"{
            "NetworkID": "n1",
            "EndpointID": "e1",
            "Interface": {"Address": "10.9.0.2/24", "AddressIPv6": "", "MacAddress": "02:00:00:00:00:01"}
        }"#;
        let req: CreateEndpointRequest = decode(body).unwrap();
        let ep = req.endpoint_request().unwrap();

        assert_eq!(ep.address.as_deref(), Some("10.9.0.2/24"));
        assert_eq!(ep.address_ipv6, None);
        assert_eq!(ep.mac, Some(MacAddress::new([0x02, 0, 0, 0, 0, 1])));
    }

    #[test]
    fn test_create_endpoint_bad_mac() {
        let body = br#"{"NetworkID":"n1","EndpointID":"e1","Interface":{"MacAddress":"zz"}}"#;
        let req: CreateEndpointRequest = decode(body).unwrap();
        assert!(matches!(req.endpoint_request(), Err(Error::InvalidMac(_))));
    }

    #[test]
    fn test_responses_encoding() {
        let activate = serde_json::to_value(ActivateResponse::network_driver()).unwrap();
        assert_eq!(activate, json!({"Implements": ["NetworkDriver"]}));

        let caps = serde_json::to_value(CapabilitiesResponse::default()).unwrap();
        assert_eq!(caps, json!({"Scope": "local", "ConnectivityScope": "local"}));

        let created = serde_json::to_value(CreateEndpointResponse::from(EndpointInterface::default())).unwrap();
        assert_eq!(created, json!({"Interface": {}}));

        let join = JoinResponse::from(JoinInfo {
            src_name: "eth10v0".into(),
            dst_prefix: "eth".into(),
            gateway: Some("10.9.0.1".into()),
        });
        assert_eq!(
            serde_json::to_value(join).unwrap(),
            json!({
                "InterfaceName": {"SrcName": "eth10v0", "DstPrefix": "eth"},
                "Gateway": "10.9.0.1",
                "DisableGatewayService": false
            })
        );

        let err = serde_json::to_value(ErrorResponse { err: "boom".into() }).unwrap();
        assert_eq!(err, json!({"Err": "boom"}));
    }
}
