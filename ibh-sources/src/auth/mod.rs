//! All methods and structs related to user authentication against source sites.
//!
//! Every source declares one [`AuthScheme`]; the [`AuthSession`] knows how to
//! turn that declaration plus a set of [`Credentials`] into request
//! decoration: a basic-auth header, a login-form exchange whose session
//! cookie the shared client retains, an OAuth1 header, or a bearer token
//! obtained from the site's token endpoint and refreshed when it expires.
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ibh_common::log::debug;
use ibh_common::serde::{Deserialize, Serialize};
use reqwest::{Client, RequestBuilder};
use thiserror::Error;
use tokio::sync::Mutex;

/// How a source expects requests to be authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    #[default]
    None,
    /// Username + API key in the `Authorization: Basic` header.
    HttpBasic,
    /// Login form submitted as GET query parameters; the session cookie is
    /// kept by the client's cookie store.
    FormGet,
    /// Login form submitted as a POST body; cookie-based like `FormGet`.
    FormPost,
    /// OAuth 1.0a with the PLAINTEXT signature method.
    OAuth1,
    /// OAuth2 resource-owner password grant, form-encoded.
    OAuth2Password,
    /// OAuth2 password grant with a JSON body instead of a form.
    OAuth2JsonPassword,
    /// OAuth2 client-credentials grant, credentials in the form body.
    OAuth2ClientCredentials,
    /// OAuth2 client-credentials grant, credentials in a basic-auth header.
    OAuth2ClientCredentialsHeader,
    /// OAuth2 with a long-lived refresh token as the root credential.
    OAuth2RefreshToken,
    /// OAuth2 authorization-code grant; the code is obtained out-of-band.
    OAuth2AuthorizationCode,
    /// OAuth2 authorization-code grant with PKCE verifier, no client secret.
    OAuth2Pkce,
}

impl AuthScheme {
    /// Whether this scheme goes through a token endpoint and bearer header.
    pub const fn is_oauth2(&self) -> bool {
        matches!(
            self,
            Self::OAuth2Password
                | Self::OAuth2JsonPassword
                | Self::OAuth2ClientCredentials
                | Self::OAuth2ClientCredentialsHeader
                | Self::OAuth2RefreshToken
                | Self::OAuth2AuthorizationCode
                | Self::OAuth2Pkce
        )
    }

    /// Whether this scheme needs a login-form exchange before the first
    /// real request.
    pub const fn is_form(&self) -> bool {
        matches!(self, Self::FormGet | Self::FormPost)
    }
}

/// Everything a user can hand a source for authentication. Which fields are
/// read depends on the scheme; the rest stay empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    /// Password or API key, depending on the site's wording.
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub access_token: String,
    pub access_secret: String,
    pub refresh_token: String,
    /// Pre-obtained authorization code for the authorization-code/PKCE
    /// grants. The interactive browser leg happens outside this crate.
    pub authorization_code: String,
    pub code_verifier: String,
    pub redirect_uri: String,
}

/// A bearer token plus the bookkeeping needed to refresh it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// Expired (or about to, within a 30 s safety margin).
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| Utc::now() + ChronoDuration::seconds(30) >= at)
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    /// Indicates that login credentials are incorrect.
    #[error("Invalid username or API key")]
    InvalidLogin,

    /// Indicates errors while connecting or parsing the response from the token endpoint.
    #[error("Connection to auth url failed")]
    ConnectionError(#[from] reqwest::Error),

    /// The scheme needs an endpoint the descriptor doesn't declare.
    #[error("Auth scheme requires a '{endpoint}' endpoint")]
    MissingEndpoint { endpoint: &'static str },

    /// The scheme needs a credential field the user didn't supply.
    #[error("Auth scheme requires the '{field}' credential")]
    MissingCredential { field: &'static str },

    /// The token endpoint answered without an access token.
    #[error("Token endpoint returned no usable access token")]
    NoToken,
}

/// Wire shape of an OAuth2 token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    #[allow(dead_code)]
    token_type: Option<String>,
}

/// Per-source authentication state. One session lives inside each
/// [`ApiClient`](crate::client::ApiClient) and is shared by every request the
/// client makes.
#[derive(Debug)]
pub struct AuthSession {
    scheme: AuthScheme,
    credentials: Credentials,
    token: Mutex<Option<AccessToken>>,
    logged_in: AtomicBool,
}

impl AuthSession {
    pub fn new(scheme: AuthScheme, credentials: Credentials) -> Self {
        Self {
            scheme,
            credentials,
            token: Mutex::new(None),
            logged_in: AtomicBool::new(false),
        }
    }

    pub const fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    /// Decorates a request with whatever the scheme injects synchronously:
    /// a basic-auth header or an OAuth1 header. Bearer tokens are attached by
    /// the client after [`Self::ensure_ready`] because they may need I/O.
    pub fn apply(&self, req: RequestBuilder) -> RequestBuilder {
        match self.scheme {
            AuthScheme::HttpBasic => {
                req.basic_auth(&self.credentials.username, Some(&self.credentials.password))
            }
            AuthScheme::OAuth1 => req.header("Authorization", self.oauth1_header()),
            _ => req,
        }
    }

    /// The current bearer token, if the scheme uses one and a token is held.
    pub async fn bearer(&self) -> Option<String> {
        if !self.scheme.is_oauth2() {
            return None;
        }
        self.token.lock().await.as_ref().map(|t| t.token.clone())
    }

    /// Performs whatever up-front work the scheme needs before a request:
    /// the form-login exchange (once) or the initial/expired token fetch.
    pub async fn ensure_ready(
        &self,
        client: &Client,
        login_url: Option<&str>,
        token_url: Option<&str>,
    ) -> Result<(), AuthError> {
        if self.scheme.is_form() && !self.logged_in.load(Ordering::Acquire) {
            self.form_login(client, login_url).await?;
            self.logged_in.store(true, Ordering::Release);
        }

        if self.scheme.is_oauth2() {
            let mut held = self.token.lock().await;
            let stale = held.as_ref().is_none_or(AccessToken::is_expired);
            if stale {
                *held = Some(self.fetch_token(client, token_url, held.as_ref()).await?);
            }
        }

        Ok(())
    }

    /// Drops the held token and fetches a fresh one. Called by the client
    /// exactly once when a request comes back 401.
    pub async fn refresh(
        &self,
        client: &Client,
        token_url: Option<&str>,
    ) -> Result<(), AuthError> {
        if !self.scheme.is_oauth2() {
            return Err(AuthError::InvalidLogin);
        }
        let mut held = self.token.lock().await;
        let previous = held.take();
        debug!("Refreshing expired access token");
        *held = Some(self.fetch_token(client, token_url, previous.as_ref()).await?);
        Ok(())
    }

    async fn form_login(&self, client: &Client, login_url: Option<&str>) -> Result<(), AuthError> {
        let url = login_url.ok_or(AuthError::MissingEndpoint { endpoint: "login" })?;
        let pairs = [
            ("login", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
        ];

        debug!("Submitting login form to {url}");
        let response = match self.scheme {
            AuthScheme::FormGet => client.get(url).query(&pairs).send().await?,
            AuthScheme::FormPost => client.post(url).form(&pairs).send().await?,
            _ => return Ok(()),
        };

        if response.status().is_client_error() {
            return Err(AuthError::InvalidLogin);
        }
        Ok(())
    }

    /// One round-trip to the token endpoint, with the grant body shaped by
    /// the scheme. `previous` lets an expired token be renewed through its
    /// refresh token instead of re-running the original grant.
    async fn fetch_token(
        &self,
        client: &Client,
        token_url: Option<&str>,
        previous: Option<&AccessToken>,
    ) -> Result<AccessToken, AuthError> {
        let url = token_url.ok_or(AuthError::MissingEndpoint { endpoint: "token" })?;
        let creds = &self.credentials;

        let refresh = previous.and_then(|t| t.refresh_token.clone());
        let request = if let Some(refresh_token) = refresh.as_deref() {
            client.post(url).form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", creds.client_id.as_str()),
                ("client_secret", creds.client_secret.as_str()),
            ])
        } else {
            match self.scheme {
                AuthScheme::OAuth2Password => client.post(url).form(&[
                    ("grant_type", "password"),
                    ("username", creds.username.as_str()),
                    ("password", creds.password.as_str()),
                    ("client_id", creds.client_id.as_str()),
                    ("client_secret", creds.client_secret.as_str()),
                ]),
                AuthScheme::OAuth2JsonPassword => client.post(url).json(&serde_json::json!({
                    "grant_type": "password",
                    "username": creds.username,
                    "password": creds.password,
                    "client_id": creds.client_id,
                    "client_secret": creds.client_secret,
                })),
                AuthScheme::OAuth2ClientCredentials => client.post(url).form(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", creds.client_id.as_str()),
                    ("client_secret", creds.client_secret.as_str()),
                ]),
                AuthScheme::OAuth2ClientCredentialsHeader => client
                    .post(url)
                    .basic_auth(&creds.client_id, Some(&creds.client_secret))
                    .form(&[("grant_type", "client_credentials")]),
                AuthScheme::OAuth2RefreshToken => {
                    if creds.refresh_token.is_empty() {
                        return Err(AuthError::MissingCredential {
                            field: "refresh_token",
                        });
                    }
                    client.post(url).form(&[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", creds.refresh_token.as_str()),
                        ("client_id", creds.client_id.as_str()),
                        ("client_secret", creds.client_secret.as_str()),
                    ])
                }
                AuthScheme::OAuth2AuthorizationCode => {
                    if creds.authorization_code.is_empty() {
                        return Err(AuthError::MissingCredential {
                            field: "authorization_code",
                        });
                    }
                    client.post(url).form(&[
                        ("grant_type", "authorization_code"),
                        ("code", creds.authorization_code.as_str()),
                        ("redirect_uri", creds.redirect_uri.as_str()),
                        ("client_id", creds.client_id.as_str()),
                        ("client_secret", creds.client_secret.as_str()),
                    ])
                }
                AuthScheme::OAuth2Pkce => {
                    if creds.code_verifier.is_empty() {
                        return Err(AuthError::MissingCredential {
                            field: "code_verifier",
                        });
                    }
                    client.post(url).form(&[
                        ("grant_type", "authorization_code"),
                        ("code", creds.authorization_code.as_str()),
                        ("redirect_uri", creds.redirect_uri.as_str()),
                        ("client_id", creds.client_id.as_str()),
                        ("code_verifier", creds.code_verifier.as_str()),
                    ])
                }
                _ => return Err(AuthError::MissingEndpoint { endpoint: "token" }),
            }
        };

        let response = request.send().await?;
        if response.status().as_u16() == 401 || response.status().as_u16() == 400 {
            return Err(AuthError::InvalidLogin);
        }
        let body: TokenResponse = response.json().await?;

        let token = body.access_token.ok_or(AuthError::NoToken)?;
        debug!("Obtained access token from {url}");
        Ok(AccessToken {
            token,
            refresh_token: body.refresh_token,
            expires_at: body
                .expires_in
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
        })
    }

    /// OAuth 1.0a header using the PLAINTEXT signature method. The signature
    /// is `consumer_secret&token_secret`, percent-encoded.
    fn oauth1_header(&self) -> String {
        let creds = &self.credentials;
        format!(
            "OAuth oauth_consumer_key=\"{}\", oauth_token=\"{}\", \
             oauth_signature_method=\"PLAINTEXT\", oauth_timestamp=\"{}\", \
             oauth_version=\"1.0\", oauth_signature=\"{}%26{}\"",
            creds.consumer_key,
            creds.access_token,
            Utc::now().timestamp(),
            creds.consumer_secret,
            creds.access_secret,
        )
    }
}
