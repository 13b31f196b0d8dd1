use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot parse topic {0:?}")]
pub struct TopicError(pub String);

/// `<prefix>/<device_type>/<component>/<address>/<subtopic>`; the prefix may contain `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopic<'a> {
    pub prefix: &'a str,
    pub device_type: &'a str,
    pub component: &'a str,
    pub address: &'a str,
    pub subtopic: &'a str,
}

impl<'a> DeviceTopic<'a> {
    pub fn parse(topic: &'a str) -> Result<Self, TopicError> {
        let mut parts = topic.rsplitn(5, '/');
        let subtopic = parts.next();
        let address = parts.next();
        let component = parts.next();
        let device_type = parts.next();
        let prefix = parts.next();
        match (prefix, device_type, component, address, subtopic) {
            (Some(prefix), Some(device_type), Some(component), Some(address), Some(subtopic)) => {
                Ok(Self { prefix, device_type, component, address, subtopic })
            }
            _ => Err(TopicError(topic.to_string())),
        }
    }
}

/// Component segment of a topic below `prefix`: `<prefix>/<type>/<component>/...`.
///
/// `None` for topics outside the prefix or without a component. The prefix
/// may itself contain `/`.
pub fn component_of<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let mut parts = rest.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(component), Some(_)) if !component.is_empty() => Some(component),
        _ => None,
    }
}

/// Base path of one device: `<prefix>/cover/somfy/<address>`.
pub fn device_base(prefix: &str, device_type: &str, component: &str, address: &str) -> String {
    format!("{prefix}/{device_type}/{component}/{address}")
}
