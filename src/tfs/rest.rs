//! Minimal TFS REST client: connection data, shelvesets and identities.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use super::{Shelveset, UserInfo};
use crate::error::{BridgeError, Result};

const VALID_USERS_GROUP: &str = "Project Collection Valid Users";
/// The identities endpoint rejects longer descriptor lists.
const DESCRIPTOR_BATCH: usize = 100;

pub(crate) struct RestClient {
    base: Url,
    agent: ureq::Agent,
    authorization: Option<String>,
}

impl RestClient {
    /// `collection_uri` is the collection root, e.g. `https://host/tfs/DefaultCollection`.
    pub fn new(collection_uri: &str, pat: Option<&str>) -> Result<Self> {
        let mut base = Url::parse(collection_uri)
            .map_err(|e| BridgeError::Config(format!("invalid TFS URI '{collection_uri}': {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(60))
            .build();

        let authorization = pat
            .filter(|p| !p.is_empty())
            .map(|p| format!("Basic {}", STANDARD.encode(format!(":{p}"))));

        Ok(Self {
            base,
            agent,
            authorization,
        })
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| BridgeError::Config(e.to_string()))?;
        url.query_pairs_mut().extend_pairs(query);

        tracing::debug!(%url, "GET");
        let mut request = self.agent.get(url.as_str()).set("Accept", "application/json");
        if let Some(auth) = &self.authorization {
            request = request.set("Authorization", auth);
        }

        let response = match request.call() {
            Ok(r) => r,
            Err(ureq::Error::Status(code, r)) => {
                let body = r.into_string().unwrap_or_default();
                return Err(BridgeError::Http(format!("TFS HTTP {code}: {}", body.trim())));
            }
            Err(e) => return Err(BridgeError::Http(e.to_string())),
        };
        response
            .into_json()
            .map_err(|e| BridgeError::Http(format!("invalid response from {path}: {e}")))
    }

    pub fn current_user(&self) -> Result<String> {
        let data: ConnectionData =
            self.get_json("_apis/connectionData", &[("api-version", "1.0")])?;
        data.authenticated_user
            .account_name()
            .ok_or_else(|| BridgeError::Server("server did not report the authenticated user".to_string()))
    }

    pub fn shelvesets(&self, name: Option<&str>, owner: Option<&str>) -> Result<Vec<Shelveset>> {
        let mut query = vec![("api-version", "1.0")];
        if let Some(name) = name {
            query.push(("requestData.name", name));
        }
        if let Some(owner) = owner {
            query.push(("requestData.owner", owner));
        }
        let list: ValueList<ShelvesetRef> = self.get_json("_apis/tfvc/shelvesets", &query)?;
        Ok(list.value.into_iter().map(ShelvesetRef::into_shelveset).collect())
    }

    pub fn valid_users(&self) -> Result<Vec<UserInfo>> {
        let groups: ValueList<Identity> = self.get_json(
            "_apis/identities",
            &[
                ("searchFilter", "General"),
                ("filterValue", VALID_USERS_GROUP),
                ("queryMembership", "Expanded"),
                ("api-version", "1.0"),
            ],
        )?;
        let members: Vec<String> = groups
            .value
            .into_iter()
            .flat_map(|g| g.members)
            .collect();

        let mut users = Vec::new();
        for batch in members.chunks(DESCRIPTOR_BATCH) {
            let descriptors = batch.join(",");
            let identities: ValueList<Identity> = self.get_json(
                "_apis/identities",
                &[("descriptors", descriptors.as_str()), ("api-version", "1.0")],
            )?;
            users.extend(identities.value.into_iter().filter_map(Identity::into_user));
        }
        users.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        users.dedup_by(|a, b| a.code.eq_ignore_ascii_case(&b.code));
        Ok(users)
    }
}

#[derive(Deserialize)]
struct ValueList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionData {
    authenticated_user: Identity,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Identity {
    #[serde(default)]
    provider_display_name: Option<String>,
    #[serde(default)]
    custom_display_name: Option<String>,
    #[serde(default)]
    is_container: bool,
    #[serde(default)]
    is_active: Option<bool>,
    #[serde(default)]
    properties: IdentityProperties,
    #[serde(default)]
    members: Vec<String>,
}

#[derive(Deserialize, Default)]
struct IdentityProperties {
    #[serde(rename = "Account", default)]
    account: Option<PropertyValue>,
}

#[derive(Deserialize)]
struct PropertyValue {
    #[serde(rename = "$value")]
    value: String,
}

impl Identity {
    fn display_name(&self) -> Option<String> {
        self.custom_display_name
            .clone()
            .or_else(|| self.provider_display_name.clone())
            .filter(|s| !s.is_empty())
    }

    fn account_name(&self) -> Option<String> {
        self.properties
            .account
            .as_ref()
            .map(|p| p.value.clone())
            .filter(|s| !s.is_empty())
            .or_else(|| self.display_name())
    }

    fn into_user(self) -> Option<UserInfo> {
        if self.is_container || self.is_active == Some(false) {
            return None;
        }
        let code = self.account_name()?;
        let name = self.display_name().unwrap_or_else(|| code.clone());
        Some(UserInfo { name, code })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShelvesetRef {
    name: String,
    #[serde(default)]
    owner: Option<IdentityRef>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    created_date: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRef {
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    unique_name: String,
}

impl ShelvesetRef {
    fn into_shelveset(self) -> Shelveset {
        let (owner, owner_display_name) = match self.owner {
            Some(o) => {
                let owner = if o.unique_name.is_empty() {
                    o.display_name.clone()
                } else {
                    o.unique_name
                };
                (owner, o.display_name)
            }
            None => (String::new(), String::new()),
        };
        Shelveset {
            name: self.name,
            owner,
            owner_display_name,
            comment: self.comment.filter(|c| !c.is_empty()),
            created: self.created_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_keeps_collection_segment() {
        let client = RestClient::new("https://tfs.example.com/tfs/DefaultCollection", None).unwrap();
        let url = client.base.join("_apis/connectionData").unwrap();
        assert_eq!(
            url.as_str(),
            "https://tfs.example.com/tfs/DefaultCollection/_apis/connectionData"
        );
        assert!(client.authorization.is_none());
    }

    #[test]
    fn test_pat_becomes_basic_auth() {
        let client = RestClient::new("https://tfs.example.com/tfs/Coll/", Some("secret")).unwrap();
        assert_eq!(client.authorization.as_deref(), Some("Basic OnNlY3JldA=="));
    }

    #[test]
    fn test_invalid_uri_is_config_error() {
        assert!(matches!(
            RestClient::new("::nope", None),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_parse_shelvesets() {
        let json = r#"{
            "count": 1,
            "value": [{
                "id": "fix_3;a1b2",
                "name": "fix_3",
                "owner": { "displayName": "Jo Doe", "uniqueName": "DOMAIN\\jo" },
                "createdDate": "2024-05-02T10:11:12.13Z",
                "comment": ""
            }]
        }"#;
        let list: ValueList<ShelvesetRef> = serde_json::from_str(json).unwrap();
        let sets: Vec<Shelveset> = list.value.into_iter().map(ShelvesetRef::into_shelveset).collect();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].name, "fix_3");
        assert_eq!(sets[0].owner, "DOMAIN\\jo");
        assert_eq!(sets[0].owner_display_name, "Jo Doe");
        assert_eq!(sets[0].comment, None);
    }

    #[test]
    fn test_parse_identities() {
        let json = r#"{
            "count": 3,
            "value": [
                { "providerDisplayName": "Jo Doe", "isContainer": false, "isActive": true,
                  "properties": { "Account": { "$type": "System.String", "$value": "DOMAIN\\jo" } } },
                { "providerDisplayName": "[Coll]\\Readers", "isContainer": true,
                  "properties": {} },
                { "providerDisplayName": "Gone", "isContainer": false, "isActive": false,
                  "properties": { "Account": { "$value": "DOMAIN\\gone" } } }
            ]
        }"#;
        let list: ValueList<Identity> = serde_json::from_str(json).unwrap();
        let users: Vec<UserInfo> = list.value.into_iter().filter_map(Identity::into_user).collect();
        assert_eq!(
            users,
            vec![UserInfo {
                name: "Jo Doe".to_string(),
                code: "DOMAIN\\jo".to_string()
            }]
        );
    }

    #[test]
    fn test_connection_data_account() {
        let json = r#"{ "authenticatedUser": { "providerDisplayName": "Jo Doe",
            "properties": { "Account": { "$value": "DOMAIN\\jo" } } } }"#;
        let data: ConnectionData = serde_json::from_str(json).unwrap();
        assert_eq!(data.authenticated_user.account_name().as_deref(), Some("DOMAIN\\jo"));
    }
}
