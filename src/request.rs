//! Validated inputs for provisioning operations.

use camino::Utf8PathBuf;

use crate::openstack::{OpenstackError, ServerId};

/// Image used when none is configured.
pub const DEFAULT_IMAGE: &str = "CentOS-Cloud-7";
/// Flavor used when none is configured.
pub const DEFAULT_FLAVOR: &str = "m1.medium";

/// Everything needed to create and expose one VM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateRequest {
    /// Server name; must be unique across the tenant.
    pub name: String,
    /// Public key files granted root access.
    pub public_key_files: Vec<Utf8PathBuf>,
    /// Image name resolved through the image service.
    pub image: String,
    /// Flavor name resolved through the compute service.
    pub flavor: String,
    /// Report the fixed address and skip floating assignment.
    pub private: bool,
    /// Router whose network carries the reported address.
    pub router_name: Option<String>,
    /// Size of an extra volume in GB, if any.
    pub volume_size_gb: Option<u32>,
    /// Cloud-config template replacing the built-in one.
    pub userdata_template: Option<Utf8PathBuf>,
}

impl CreateRequest {
    /// Starts a builder with the default image and flavor.
    #[must_use]
    pub fn builder() -> CreateRequestBuilder {
        CreateRequestBuilder::new()
    }

    /// Validates the request.
    ///
    /// # Errors
    ///
    /// Returns [`OpenstackError::Usage`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), OpenstackError> {
        if self.name.is_empty() {
            return Err(invalid("name"));
        }
        if self.public_key_files.is_empty() {
            return Err(invalid("public key files"));
        }
        if self.image.is_empty() {
            return Err(invalid("image"));
        }
        if self.flavor.is_empty() {
            return Err(invalid("flavor"));
        }
        if self.volume_size_gb == Some(0) {
            return Err(invalid("volume size"));
        }
        Ok(())
    }

    /// Lookup matching the server this request creates.
    #[must_use]
    pub fn lookup(&self) -> ServerLookup {
        ServerLookup::by_name(&self.name)
    }
}

fn invalid(field: &str) -> OpenstackError {
    OpenstackError::Usage(format!("missing or invalid {field}"))
}

/// Builder for [`CreateRequest`] that trims text fields on build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateRequestBuilder {
    request: CreateRequest,
}

impl Default for CreateRequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CreateRequestBuilder {
    /// Creates a builder with the default image and flavor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            request: CreateRequest {
                name: String::new(),
                public_key_files: Vec::new(),
                image: DEFAULT_IMAGE.to_owned(),
                flavor: DEFAULT_FLAVOR.to_owned(),
                private: false,
                router_name: None,
                volume_size_gb: None,
                userdata_template: None,
            },
        }
    }

    /// Sets the server name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.request.name = value.into();
        self
    }

    /// Adds one public key file.
    #[must_use]
    pub fn public_key_file(mut self, value: impl Into<Utf8PathBuf>) -> Self {
        self.request.public_key_files.push(value.into());
        self
    }

    /// Sets the image name.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.request.image = value.into();
        self
    }

    /// Sets the flavor name.
    #[must_use]
    pub fn flavor(mut self, value: impl Into<String>) -> Self {
        self.request.flavor = value.into();
        self
    }

    /// Reports the fixed address instead of assigning a floating one.
    #[must_use]
    pub const fn private(mut self, value: bool) -> Self {
        self.request.private = value;
        self
    }

    /// Sets the router name.
    #[must_use]
    pub fn router_name(mut self, value: Option<String>) -> Self {
        self.request.router_name = value;
        self
    }

    /// Requests an extra volume of `value` GB.
    #[must_use]
    pub const fn volume_size_gb(mut self, value: Option<u32>) -> Self {
        self.request.volume_size_gb = value;
        self
    }

    /// Uses a custom cloud-config template.
    #[must_use]
    pub fn userdata_template(mut self, value: Option<Utf8PathBuf>) -> Self {
        self.request.userdata_template = value;
        self
    }

    /// Trims text fields and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`OpenstackError::Usage`] when validation fails.
    pub fn build(self) -> Result<CreateRequest, OpenstackError> {
        let CreateRequest {
            name,
            public_key_files,
            image,
            flavor,
            private,
            router_name,
            volume_size_gb,
            userdata_template,
        } = self.request;
        let request = CreateRequest {
            name: name.trim().to_owned(),
            public_key_files,
            image: image.trim().to_owned(),
            flavor: flavor.trim().to_owned(),
            private,
            router_name: router_name
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty()),
            volume_size_gb,
            userdata_template,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Identifies a server by name, id, or both.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerLookup {
    name: Option<String>,
    id: Option<ServerId>,
}

impl ServerLookup {
    /// Matches servers by display name.
    #[must_use]
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            id: None,
        }
    }

    /// Matches exactly one server id.
    #[must_use]
    pub const fn by_id(id: ServerId) -> Self {
        Self {
            name: None,
            id: Some(id),
        }
    }

    /// Pins a name lookup to a known id.
    #[must_use]
    pub fn with_id(mut self, id: ServerId) -> Self {
        self.id = Some(id);
        self
    }

    /// Name being looked up.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Id being looked up.
    #[must_use]
    pub const fn id(&self) -> Option<&ServerId> {
        self.id.as_ref()
    }

    /// Short label for logs and errors.
    #[must_use]
    pub fn describe(&self) -> String {
        match (&self.name, &self.id) {
            (Some(name), Some(id)) => format!("server '{name}' ({id})"),
            (Some(name), None) => format!("server '{name}'"),
            (None, Some(id)) => format!("server {id}"),
            (None, None) => String::from("server <unspecified>"),
        }
    }
}
