use crate::backend::{
    Backend,
    BackendError,
};
use reqwest::StatusCode;
use serde_json::{
    Value,
    json,
};
use session_store::Identity;
use url::Url;

const GENESIS_CONFIG_QUERY: &str = "query { genesisConfig }";
const CLAIM_MUTATION: &str = "mutation Claim($owner: AccountOwner!) { claim(owner: $owner) }";
const TYPENAME_QUERY: &str = "query { __typename }";

/// Wallet handed out by the faucet. The genesis config is kept verbatim.
#[derive(Clone, Debug)]
pub struct GraphQlWallet {
    pub genesis_config: Value,
    pub chain_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct GraphQlSession {
    pub chain_id: String,
    pub owner: String,
}

#[derive(Clone, Debug)]
pub struct GraphQlApplication {
    pub endpoint: Url,
}

/// [`Backend`] that talks to a faucet and a node service over GraphQL.
///
/// There is no local engine: `init_engine` always succeeds, and the session is
/// the pair of claimed chain and owner address.
#[derive(Clone)]
pub struct GraphQlBackend {
    node_url: Url,
    http: reqwest::Client,
}

impl GraphQlBackend {
    pub fn new(node_url: Url) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| BackendError::new(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { node_url, http })
    }

    pub fn node_url(&self) -> &Url {
        &self.node_url
    }

    /// `Ok(None)` on 404; any other non-success status is an error.
    async fn post(
        &self,
        url: Url,
        body: &Value,
        what: &str,
    ) -> Result<Option<Value>, BackendError> {
        let res = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::new(format!("{what} request failed: {e}")))?;
        let status = res.status();
        let bytes = res.bytes().await.map_err(|e| {
            BackendError::new(format!("failed to read {what} response body: {e}"))
        })?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(BackendError::new(format!(
                "{what} responded with {status}: {body}"
            )));
        }
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| BackendError::new(format!("invalid {what} payload: {e}")))?;
        Ok(Some(value))
    }

    async fn faucet_data(&self, faucet: &Url, body: Value) -> Result<Value, BackendError> {
        let response = self
            .post(faucet.clone(), &body, "faucet")
            .await?
            .ok_or_else(|| BackendError::new(format!("faucet not found at {faucet}")))?;
        graphql_data(response)
    }
}

impl Backend for GraphQlBackend {
    type Faucet = Url;
    type Wallet = GraphQlWallet;
    type Session = GraphQlSession;
    type Application = GraphQlApplication;

    async fn init_engine(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn faucet(&self, url: &Url) -> Result<Url, BackendError> {
        Ok(url.clone())
    }

    async fn create_wallet(&self, faucet: &Url) -> Result<GraphQlWallet, BackendError> {
        let data = self
            .faucet_data(faucet, json!({ "query": GENESIS_CONFIG_QUERY }))
            .await?;
        let genesis_config = data
            .get("genesisConfig")
            .cloned()
            .filter(|config| !config.is_null())
            .ok_or_else(|| BackendError::new("faucet returned no genesis config"))?;
        Ok(GraphQlWallet {
            genesis_config,
            chain_id: None,
        })
    }

    async fn claim_chain(
        &self,
        faucet: &Url,
        wallet: &mut GraphQlWallet,
        owner: &str,
    ) -> Result<String, BackendError> {
        let data = self
            .faucet_data(
                faucet,
                json!({
                    "query": CLAIM_MUTATION,
                    "variables": { "owner": owner },
                }),
            )
            .await?;
        let chain_id = claimed_chain_id(&data)
            .ok_or_else(|| BackendError::new("faucet claim returned no chain id"))?;
        wallet.chain_id = Some(chain_id.clone());
        Ok(chain_id)
    }

    async fn open_session(
        &self,
        wallet: &GraphQlWallet,
        identity: &Identity,
    ) -> Result<GraphQlSession, BackendError> {
        let chain_id = wallet
            .chain_id
            .clone()
            .ok_or_else(|| BackendError::new("wallet has no claimed chain"))?;
        Ok(GraphQlSession {
            chain_id,
            owner: identity.address().to_string(),
        })
    }

    async fn application(
        &self,
        session: &GraphQlSession,
        application_id: &str,
    ) -> Result<Option<GraphQlApplication>, BackendError> {
        let endpoint = application_url(&self.node_url, &session.chain_id, application_id)?;
        let reachable = self
            .post(endpoint.clone(), &json!({ "query": TYPENAME_QUERY }), "node service")
            .await?;
        match reachable {
            None => Ok(None),
            Some(response) => {
                graphql_data(response)?;
                Ok(Some(GraphQlApplication { endpoint }))
            }
        }
    }

    async fn query(
        &self,
        application: &GraphQlApplication,
        request: Value,
    ) -> Result<Value, BackendError> {
        let response = self
            .post(application.endpoint.clone(), &request, "application")
            .await?
            .ok_or_else(|| {
                BackendError::new(format!("application gone at {}", application.endpoint))
            })?;
        if let Some(message) = graphql_errors(&response) {
            return Err(BackendError::new(message));
        }
        Ok(response)
    }
}

/// `<node>/chains/<chain>/applications/<app>`
pub fn application_url(
    node_url: &Url,
    chain_id: &str,
    application_id: &str,
) -> Result<Url, BackendError> {
    let mut url = node_url.clone();
    url.path_segments_mut()
        .map_err(|()| BackendError::new(format!("node URL cannot be a base: {node_url}")))?
        .pop_if_empty()
        .extend(["chains", chain_id, "applications", application_id]);
    Ok(url)
}

/// Joined messages of a non-empty GraphQL `errors` array.
pub fn graphql_errors(response: &Value) -> Option<String> {
    let errors = response.get("errors")?.as_array()?;
    if errors.is_empty() {
        return None;
    }
    let messages: Vec<String> = errors
        .iter()
        .map(|error| match error.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => error.to_string(),
        })
        .collect();
    Some(messages.join("; "))
}

fn graphql_data(response: Value) -> Result<Value, BackendError> {
    if let Some(message) = graphql_errors(&response) {
        return Err(BackendError::new(message));
    }
    match response {
        Value::Object(mut fields) => fields
            .remove("data")
            .filter(|data| !data.is_null())
            .ok_or_else(|| BackendError::new("GraphQL response has no data")),
        _ => Err(BackendError::new("GraphQL response is not an object")),
    }
}

// faucets answer either with the bare chain id or with a chain description
fn claimed_chain_id(data: &Value) -> Option<String> {
    let claim = data.get("claim")?;
    if let Some(id) = claim.as_str() {
        return Some(id.to_string());
    }
    ["chainId", "id"]
        .iter()
        .find_map(|key| claim.get(key).and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        connector::Connector,
        error::{
            ConnectionError,
            HandshakePhase,
        },
    };
    use wiremock::{
        Mock,
        MockServer,
        ResponseTemplate,
        matchers::{
            body_string_contains,
            method,
            path,
        },
    };

    const APP_PATH: &str = "/node/chains/e476187f/applications/portfolio-app";

    fn faucet_url(server: &MockServer) -> Url {
        Url::parse(&format!("{}/faucet", server.uri())).unwrap()
    }

    fn connector_for(server: &MockServer) -> Connector<GraphQlBackend> {
        let node_url = Url::parse(&format!("{}/node", server.uri())).unwrap();
        Connector::new(GraphQlBackend::new(node_url).unwrap())
    }

    async fn mount_faucet(server: &MockServer, claim: Value) {
        Mock::given(method("POST"))
            .and(path("/faucet"))
            .and(body_string_contains("genesisConfig"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "genesisConfig": { "committee": [] } }
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/faucet"))
            .and(body_string_contains("claim"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "data": { "claim": claim } })),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn connect__claim_returns_bare_chain_id__uses_it() {
        // given
        let server = MockServer::start().await;
        mount_faucet(&server, json!("e476187f")).await;
        let connector = connector_for(&server);
        let identity = Identity::generate().unwrap();

        // when
        let pending = connector
            .connect(&faucet_url(&server), &identity)
            .await
            .unwrap();

        // then
        assert_eq!(pending.chain_id(), "e476187f");
        assert_eq!(pending.address(), identity.address());
    }

    #[tokio::test]
    async fn connect__claim_returns_chain_description__reads_chain_id() {
        // given
        let server = MockServer::start().await;
        mount_faucet(
            &server,
            json!({ "chainId": "e476187f", "certificateHash": "ab12" }),
        )
        .await;
        let connector = connector_for(&server);
        let identity = Identity::generate().unwrap();

        // when
        let pending = connector
            .connect(&faucet_url(&server), &identity)
            .await
            .unwrap();

        // then
        assert_eq!(pending.chain_id(), "e476187f");
    }

    #[tokio::test]
    async fn connect__faucet_server_error__is_bootstrap_failure_with_body() {
        // given
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/faucet"))
            .respond_with(ResponseTemplate::new(500).set_body_string("faucet is out of tokens"))
            .mount(&server)
            .await;
        let connector = connector_for(&server);
        let identity = Identity::generate().unwrap();

        // when
        let err = connector
            .connect(&faucet_url(&server), &identity)
            .await
            .err()
            .unwrap();

        // then
        match err {
            ConnectionError::HandshakePhase { phase, cause } => {
                assert_eq!(phase, HandshakePhase::Bootstrap);
                assert!(cause.contains("500"), "{cause}");
                assert!(cause.contains("faucet is out of tokens"), "{cause}");
            }
            other => panic!("expected a bootstrap failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bind_application__node_answers_404__is_application_not_found() {
        // given
        let server = MockServer::start().await;
        mount_faucet(&server, json!("e476187f")).await;
        Mock::given(method("POST"))
            .and(path(APP_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let connector = connector_for(&server);
        let identity = Identity::generate().unwrap();
        let pending = connector
            .connect(&faucet_url(&server), &identity)
            .await
            .unwrap();

        // when
        let err = connector
            .bind_application(pending, "portfolio-app")
            .await
            .err()
            .unwrap();

        // then
        assert_eq!(
            err,
            ConnectionError::ApplicationNotFound("portfolio-app".to_string())
        );
    }

    #[tokio::test]
    async fn query__response_with_errors_array__is_query_failed() {
        // given
        let server = MockServer::start().await;
        mount_faucet(&server, json!("e476187f")).await;
        Mock::given(method("POST"))
            .and(path(APP_PATH))
            .and(body_string_contains("__typename"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "data": { "__typename": "QueryRoot" } })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(APP_PATH))
            .and(body_string_contains("positions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": null,
                "errors": [{ "message": "unknown field `positions`" }],
            })))
            .mount(&server)
            .await;
        let connector = connector_for(&server);
        let identity = Identity::generate().unwrap();
        let pending = connector
            .connect(&faucet_url(&server), &identity)
            .await
            .unwrap();
        let connection = connector
            .bind_application(pending, "portfolio-app")
            .await
            .unwrap();

        // when
        let err = connector
            .query::<_, Value>(&connection, &json!({ "query": "query { positions }" }))
            .await
            .err()
            .unwrap();

        // then
        assert_eq!(
            err,
            ConnectionError::QueryFailed("unknown field `positions`".to_string())
        );
    }

    #[test]
    fn application_url__trailing_slash__builds_nested_path() {
        // given
        let node = Url::parse("http://localhost:8080/").unwrap();

        // when
        let url = application_url(&node, "e476", "app-1").unwrap();

        // then
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/chains/e476/applications/app-1"
        );
    }

    #[test]
    fn application_url__base_path__is_kept() {
        let node = Url::parse("https://node.example.com/api").unwrap();

        let url = application_url(&node, "c", "a").unwrap();

        assert_eq!(url.as_str(), "https://node.example.com/api/chains/c/applications/a");
    }

    #[test]
    fn application_url__non_base_url__is_rejected() {
        let node = Url::parse("mailto:ops@example.com").unwrap();

        assert!(application_url(&node, "c", "a").is_err());
    }

    #[test]
    fn graphql_errors__error_array__joins_messages() {
        // given
        let response = json!({
            "data": null,
            "errors": [
                { "message": "unknown field" },
                { "message": "chain not active" },
            ],
        });

        // when
        let message = graphql_errors(&response);

        // then
        assert_eq!(message.as_deref(), Some("unknown field; chain not active"));
    }

    #[test]
    fn graphql_errors__empty_or_missing__is_none() {
        assert_eq!(graphql_errors(&json!({ "data": {}, "errors": [] })), None);
        assert_eq!(graphql_errors(&json!({ "data": {} })), None);
    }

    #[test]
    fn graphql_data__errors_present__fails() {
        let response = json!({ "errors": [{ "message": "boom" }] });

        let err = graphql_data(response).unwrap_err();

        assert_eq!(err, BackendError::new("boom"));
    }

    #[test]
    fn graphql_data__null_data__fails() {
        assert!(graphql_data(json!({ "data": null })).is_err());
    }

    #[test]
    fn claimed_chain_id__bare_string__is_returned() {
        let data = json!({ "claim": "e476187f" });

        assert_eq!(claimed_chain_id(&data).as_deref(), Some("e476187f"));
    }

    #[test]
    fn claimed_chain_id__description_object__reads_chain_id() {
        let data = json!({ "claim": { "chainId": "e476187f", "certificateHash": "ab" } });

        assert_eq!(claimed_chain_id(&data).as_deref(), Some("e476187f"));
    }

    #[test]
    fn claimed_chain_id__missing__is_none() {
        assert_eq!(claimed_chain_id(&json!({ "claim": {} })), None);
        assert_eq!(claimed_chain_id(&json!({})), None);
    }
}
