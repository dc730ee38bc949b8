use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::*;
use reqwest::{
    header::{HeaderName, HeaderValue, CONTENT_TYPE},
    Method, RequestBuilder, Response, StatusCode,
};
use serde::Deserialize;
use tokio::sync::OnceCell;
use url::Url;

pub const DEFAULT_SERVER: &str = "ci.makewhat.is:8080";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Authentication information
pub struct Auth {
    /// Username
    username: String,
    /// Password or API token
    password: String,
}

impl Auth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

/// A Jenkins server address
///
/// `label` names the server in output paths. It is the address as given, minus any scheme, with
/// `/` replaced so it can be used as a single directory name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    base_url: Url,
    label: String,
}

impl Server {
    /// Parse `host:port` (plain http assumed) or a full `http(s)://` URL
    pub fn parse(server: &str) -> Result<Self> {
        let server = server.trim().trim_end_matches('/');
        if server.is_empty() {
            bail!("Empty server address");
        }
        let (full, bare) = match server.split_once("://") {
            Some((_, rest)) => (server.to_string(), rest),
            None => (format!("http://{}", server), server),
        };
        let base_url =
            Url::parse(&full).with_context(|| format!("Invalid server address: {}", server))?;
        if base_url.cannot_be_a_base() {
            bail!("Invalid server address: {}", server);
        }

        Ok(Self {
            base_url,
            label: bare.replace('/', "_"),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Append percent-encoded path segments to the base URL
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("{} cannot be a base URL", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn job_url(&self, name: &str, action: &str) -> Result<Url> {
        self.endpoint(&["job", name, action])
    }

    fn jobs_url(&self) -> Result<Url> {
        let mut url = self.endpoint(&["api", "json"])?;
        url.query_pairs_mut().append_pair("tree", "jobs[name]");
        Ok(url)
    }

    fn create_url(&self, name: &str) -> Result<Url> {
        let mut url = self.endpoint(&["createItem"])?;
        url.query_pairs_mut().append_pair("name", name);
        Ok(url)
    }
}

/// Remote job definition operations
///
/// `get_config` returning `None` is the "unknown job" signal.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Names of all top-level jobs, in server order
    async fn list_jobs(&self) -> Result<Vec<String>>;
    async fn get_config(&self, name: &str) -> Result<Option<String>>;
    async fn update_config(&self, name: &str, config: &str) -> Result<()>;
    async fn create_job(&self, name: &str, config: &str) -> Result<()>;
    async fn delete_job(&self, name: &str) -> Result<()>;
    /// Enable or disable a job, returning the HTTP status of the toggle call
    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<u16>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Crumb {
    crumb_request_field: String,
    crumb: String,
}

/// A Jenkins API client
#[derive(Debug)]
pub struct Client {
    server: Server,
    auth: Option<Auth>,
    http_client: reqwest::Client,
    /// CSRF header attached to every POST, fetched before the first one
    crumb: OnceCell<Option<(HeaderName, HeaderValue)>>,
}

impl Client {
    /// Build a client. Nothing is sent until the first request.
    pub fn new(server: Server, auth: Option<Auth>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .context("Could not build HTTP client")?;
        Ok(Self {
            server,
            auth,
            http_client,
            crumb: OnceCell::new(),
        })
    }

    fn authed(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.http_client.request(method, url);
        match &self.auth {
            Some(auth) => request.basic_auth(&auth.username, Some(&auth.password)),
            None => request,
        }
    }

    async fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let is_post = method == Method::POST;
        let mut request = self.authed(method, url);
        if is_post {
            if let Some((name, value)) = self.crumb().await {
                request = request.header(name.clone(), value.clone());
            }
        }
        request
    }

    /// The server's crumb, or `None` if it has no crumb issuer
    async fn crumb(&self) -> Option<&(HeaderName, HeaderValue)> {
        self.crumb
            .get_or_init(|| async {
                match self.fetch_crumb().await {
                    Ok(crumb) => Some(crumb),
                    Err(e) => {
                        debug!("No crumb from {}: {:#}", self.server.label(), e);
                        None
                    }
                }
            })
            .await
            .as_ref()
    }

    async fn fetch_crumb(&self) -> Result<(HeaderName, HeaderValue)> {
        let url = self.server.endpoint(&["crumbIssuer", "api", "json"])?;
        let response = ensure_success(self.authed(Method::GET, url).send().await?)?;
        let crumb: Crumb = response.json().await?;
        Ok((
            HeaderName::from_bytes(crumb.crumb_request_field.as_bytes())?,
            HeaderValue::from_str(&crumb.crumb)?,
        ))
    }

    async fn post_xml(&self, url: Url, config: &str) -> Result<Response> {
        Ok(self
            .request(Method::POST, url)
            .await
            .header(CONTENT_TYPE, "application/xml")
            .body(config.to_owned())
            .send()
            .await?)
    }
}

fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(anyhow!("{} returned {}", response.url(), status))
    }
}

#[async_trait]
impl JobStore for Client {
    async fn list_jobs(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct JobEntry {
            name: String,
        }

        #[derive(Deserialize)]
        struct JobList {
            #[serde(default)]
            jobs: Vec<JobEntry>,
        }

        let url = self.server.jobs_url()?;
        let response = self.request(Method::GET, url).await.send().await?;
        let list: JobList = ensure_success(response)?.json().await?;
        Ok(list.jobs.into_iter().map(|job| job.name).collect())
    }

    async fn get_config(&self, name: &str) -> Result<Option<String>> {
        let url = self.server.job_url(name, "config.xml")?;
        let response = self.request(Method::GET, url).await.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(ensure_success(response)?.text().await?))
    }

    async fn update_config(&self, name: &str, config: &str) -> Result<()> {
        let url = self.server.job_url(name, "config.xml")?;
        ensure_success(self.post_xml(url, config).await?)?;
        Ok(())
    }

    async fn create_job(&self, name: &str, config: &str) -> Result<()> {
        let url = self.server.create_url(name)?;
        let response = self.post_xml(url, config).await?;
        if response.status() == StatusCode::BAD_REQUEST {
            let reason = response
                .headers()
                .get("X-Error")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            if reason.contains("already exists") {
                bail!("Job {} already exists", name);
            }
        }
        ensure_success(response)?;
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        let url = self.server.job_url(name, "doDelete")?;
        let response = self.request(Method::POST, url).await.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            bail!("Unknown job {}", name);
        }
        ensure_success(response)?;
        Ok(())
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<u16> {
        let action = if enabled { "enable" } else { "disable" };
        let url = self.server.job_url(name, action)?;
        let response = self.request(Method::POST, url).await.send().await?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn host_and_port() {
        let server = Server::parse("ci.makewhat.is:8080").unwrap();
        assert_eq!("http://ci.makewhat.is:8080/", server.base_url().as_str());
        assert_eq!("ci.makewhat.is:8080", server.label());
    }

    #[test]
    fn full_url_with_path() {
        let server = Server::parse("https://example.com/jenkins/").unwrap();
        assert_eq!("https://example.com/jenkins", server.base_url().as_str());
        assert_eq!("example.com_jenkins", server.label());
        assert_eq!(
            "https://example.com/jenkins/job/build-a/config.xml",
            server.job_url("build-a", "config.xml").unwrap().as_str()
        );
    }

    #[test]
    fn empty_server() {
        assert!(Server::parse("  ").is_err());
    }

    #[test]
    fn job_names_are_single_segments() {
        let server = Server::parse("localhost:8080").unwrap();
        assert_eq!(
            "http://localhost:8080/job/my%20job%2Fx/enable",
            server.job_url("my job/x", "enable").unwrap().as_str()
        );
    }

    #[test]
    fn create_and_list_urls() {
        let server = Server::parse("localhost:8080").unwrap();
        assert_eq!(
            "http://localhost:8080/createItem?name=build+a",
            server.create_url("build a").unwrap().as_str()
        );
        assert_eq!(
            "http://localhost:8080/api/json?tree=jobs%5Bname%5D",
            server.jobs_url().unwrap().as_str()
        );
    }

    #[test]
    fn crumb_from_json() {
        let crumb: Crumb = serde_json::from_str(
            r#"{"_class":"hudson.security.csrf.DefaultCrumbIssuer","crumb":"abc123","crumbRequestField":"Jenkins-Crumb"}"#,
        )
        .unwrap();
        assert_eq!("Jenkins-Crumb", crumb.crumb_request_field);
        assert_eq!("abc123", crumb.crumb);
    }

    /// Serve one canned response per connection and record each request head
    fn serve(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);
        thread::spawn(move || {
            for response in responses {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream);
                let mut head = String::new();
                let mut content_length = 0;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                    if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                        content_length = value.trim().parse().unwrap();
                    }
                    head.push_str(&line);
                }
                let mut body = vec![0; content_length];
                reader.read_exact(&mut body).unwrap();
                seen.lock().unwrap().push(head.to_ascii_lowercase());

                let mut stream = reader.into_inner();
                stream.write_all(response.as_bytes()).unwrap();
            }
        });
        (addr, requests)
    }

    fn response(status: &str, headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            headers,
            body.len(),
            body
        )
    }

    #[tokio::test]
    async fn client_maps_jenkins_responses() {
        let (addr, requests) = serve(vec![
            response("404 Not Found", "", ""),
            response(
                "200 OK",
                "Content-Type: application/json\r\n",
                r#"{"crumbRequestField":"Jenkins-Crumb","crumb":"abc"}"#,
            ),
            response(
                "400 Bad Request",
                "X-Error: A job already exists with the name \"a\"\r\n",
                "",
            ),
            response("500 Server Error", "", ""),
        ]);
        let client = Client::new(Server::parse(&addr).unwrap(), None).unwrap();

        assert_eq!(None, client.get_config("a").await.unwrap());
        let err = client.create_job("a", "<project/>").await.unwrap_err();
        assert_eq!("Job a already exists", err.to_string());
        assert_eq!(500, client.set_enabled("a", false).await.unwrap());

        let requests = requests.lock().unwrap();
        assert_eq!(4, requests.len());
        assert!(requests[0].starts_with("get /job/a/config.xml "));
        assert!(!requests[0].contains("jenkins-crumb"));
        assert!(requests[1].starts_with("get /crumbissuer/api/json "));
        assert!(requests[2].starts_with("post /createitem?name=a "));
        assert!(requests[2].contains("jenkins-crumb: abc"));
        assert!(requests[3].starts_with("post /job/a/disable "));
        assert!(requests[3].contains("jenkins-crumb: abc"));
    }

    #[tokio::test]
    async fn client_without_crumb_issuer() {
        let (addr, requests) = serve(vec![
            response("200 OK", "", "<project/>"),
            response("404 Not Found", "", ""),
            response("200 OK", "", ""),
        ]);
        let client = Client::new(Server::parse(&addr).unwrap(), None).unwrap();

        assert_eq!(
            Some("<project/>".to_string()),
            client.get_config("a").await.unwrap()
        );
        client.update_config("a", "<project>B</project>").await.unwrap();

        let requests = requests.lock().unwrap();
        assert!(requests[1].starts_with("get /crumbissuer/api/json "));
        assert!(requests[2].starts_with("post /job/a/config.xml "));
        assert!(requests[2].contains("content-type: application/xml"));
        assert!(!requests[2].contains("jenkins-crumb"));
    }
}
