//! Allow-list of domains this service is authoritative for.

/// Configured domains, normalized to lower case.
///
/// An empty list puts SMTP intake in open mode (every recipient domain is
/// accepted) but allows no address generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainPolicy {
    allowed: Vec<String>,
}

impl DomainPolicy {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed: Vec<String> = Vec::new();
        for domain in domains {
            let domain = domain.as_ref().trim().to_ascii_lowercase();
            if !domain.is_empty() && !allowed.contains(&domain) {
                allowed.push(domain);
            }
        }
        Self { allowed }
    }

    /// Parse a comma-separated list such as `ALLOWED_DOMAINS`.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn open() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn domains(&self) -> &[String] {
        &self.allowed
    }

    /// Whether mail for `domain` is accepted.
    pub fn accepts(&self, domain: &str) -> bool {
        self.is_open() || self.is_listed(domain)
    }

    /// Whether `domain` appears on the list itself, ignoring open mode.
    pub fn is_listed(&self, domain: &str) -> bool {
        self.allowed
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(domain))
    }
}
