use std::env;
use std::fmt;
use crate::error::Error;

const NAMESPACE:     &str = "POD_NAMESPACE";
const POD_NAME:      &str = "POD_NAME";
const PROCESS_NAME:  &str = "APP_PROCESS_NAME";
const ACCESS_KEY:    &str = "AWS_ACCESS_KEY_ID";
const SECRET_KEY:    &str = "AWS_SECRET_ACCESS_KEY";
const SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
const BUCKET:        &str = "S3_BUCKET_NAME";
const REGION:        &str = "S3_REGION";
const KEY_PREFIX:    &str = "S3_KEY_PREFIX";
const ENDPOINT:      &str = "S3_ENDPOINT";

#[derive(Clone)]
pub struct Config {
    pub namespace:   String,
    pub pod:         String,
    pub process:     String,
    pub credentials: Credentials,
    pub bucket:      String,
    pub region:      String,
    pub prefix:      String,
    pub endpoint:    Option<String>,
}

#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub token:      Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Self::load(|key| env::var(key).ok())
    }

    pub fn load<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, Error> {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let req = |key: &'static str| get(key).ok_or(Error::Config(key));

        let pod         = req(POD_NAME)?;
        let process     = req(PROCESS_NAME)?;
        let bucket      = req(BUCKET)?;
        let credentials = Credentials {
            access_key: req(ACCESS_KEY)?,
            secret_key: req(SECRET_KEY)?,
            token:      get(SESSION_TOKEN),
        };

        Ok(Self {
            namespace: get(NAMESPACE).unwrap_or_else(|| "default".to_owned()),
            pod:       pod,
            process:   process,
            credentials,
            bucket:    bucket,
            region:    get(REGION).unwrap_or_else(|| "us-east-1".to_owned()),
            prefix:    get(KEY_PREFIX).unwrap_or_else(|| "recordings".to_owned()),
            endpoint:  get(ENDPOINT),
        })
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("namespace", &self.namespace)
            .field("pod", &self.pod)
            .field("process", &self.process)
            .field("access_key", &self.credentials.access_key)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .finish()
    }
}
