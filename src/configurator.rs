//! Builds regions from a flat property set
//!
//! Recognized keys:
//! - `jcs.default=<aux,...>`: auxiliaries for regions without their own list
//! - `jcs.default.cacheattributes.<Prop>`, `jcs.default.elementattributes.<Prop>`
//! - `jcs.region.<name>=<aux,...>` plus `.cacheattributes.<Prop>` and
//!   `.elementattributes.<Prop>` overrides for that region
//! - `jcs.auxiliary.<aux>=<factory id>` and `jcs.auxiliary.<aux>.attributes.<Prop>`
//!
//! `<Prop>` names are the PascalCase serde names of the attribute structs in
//! [`crate::config`] and [`crate::element`].

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{
    collections::HashMap,
    io,
    marker::PhantomData,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, error, info, warn};

use crate::{
    CacheError,
    config::{AuxiliaryCacheAttributes, CompositeCacheAttributes},
    disk_cache::{DiskBackend, DiskCache},
    element::{CacheKey, Cacheable, ElementAttributes},
    listener::{AuxiliaryCache, AuxiliaryKind},
    region_cache::{RegionCache, RegionCacheBuilder},
};

const DEFAULT_REGION: &str = "jcs.default";
const REGION_PREFIX: &str = "jcs.region.";
const AUXILIARY_PREFIX: &str = "jcs.auxiliary.";
const CACHE_ATTRIBUTES: &str = ".cacheattributes";
const ELEMENT_ATTRIBUTES: &str = ".elementattributes";
const AUXILIARY_ATTRIBUTES: &str = ".attributes";

/// Parse `key=value` lines. Blank lines and lines starting with `#` or `!`
/// are ignored; `:` is accepted as a separator too.
pub fn parse_properties(text: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let Some(split) = line.find(['=', ':']) else {
            warn!("Ignoring property line without a separator: {}", line);
            continue;
        };
        let (key, value) = line.split_at(split);
        props.insert(key.trim().to_owned(), value[1..].trim().to_owned());
    }
    props
}

/// Creates auxiliary tiers for the configurator.
pub trait AuxiliaryFactory<K: CacheKey, V: Cacheable>: Send + Sync {
    /// Kind of tier this factory produces
    fn kind(&self) -> AuxiliaryKind;

    /// Create a tier for `attributes.cache_name`.
    fn create(
        &self,
        attributes: &AuxiliaryCacheAttributes,
    ) -> Result<Arc<dyn AuxiliaryCache<K, V>>, CacheError>;
}

/// Factory for [`DiskCache`] tiers over a backend built per region
pub struct DiskCacheFactory<K, V, F> {
    make_backend: F,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, F> DiskCacheFactory<K, V, F> {
    /// `make_backend` is called once per region that lists the auxiliary.
    pub fn new<B>(make_backend: F) -> Self
    where
        F: Fn(&AuxiliaryCacheAttributes) -> io::Result<B>,
    {
        Self {
            make_backend,
            _marker: PhantomData,
        }
    }
}

impl<K, V, B, F> AuxiliaryFactory<K, V> for DiskCacheFactory<K, V, F>
where
    K: CacheKey,
    V: Cacheable,
    B: DiskBackend<K, V>,
    F: Fn(&AuxiliaryCacheAttributes) -> io::Result<B> + Send + Sync,
{
    fn kind(&self) -> AuxiliaryKind {
        AuxiliaryKind::Disk
    }

    fn create(
        &self,
        attributes: &AuxiliaryCacheAttributes,
    ) -> Result<Arc<dyn AuxiliaryCache<K, V>>, CacheError> {
        let backend = (self.make_backend)(attributes)?;
        Ok(Arc::new(DiskCache::new(attributes.clone(), backend)?))
    }
}

/// Turns property sets into regions.
///
/// Factories are registered up front under the id that `jcs.auxiliary.<aux>`
/// refers to. Parsed auxiliary attributes are kept per auxiliary name and
/// reused for every region that lists it.
pub struct CacheConfigurator<K: CacheKey, V: Cacheable> {
    factories: HashMap<String, Arc<dyn AuxiliaryFactory<K, V>>>,
    attribute_registry: Mutex<HashMap<String, AuxiliaryCacheAttributes>>,
}

impl<K: CacheKey, V: Cacheable> Default for CacheConfigurator<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CacheKey, V: Cacheable> CacheConfigurator<K, V> {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            attribute_registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_factory(
        &mut self,
        id: impl Into<String>,
        factory: Arc<dyn AuxiliaryFactory<K, V>>,
    ) {
        let id = id.into();
        debug!("Registered auxiliary factory {} ({:?})", id, factory.kind());
        self.factories.insert(id, factory);
    }

    /// Build every region named by a `jcs.region.<name>` key.
    pub fn configure(
        &self,
        props: &HashMap<String, String>,
    ) -> Result<HashMap<String, RegionCache<K, V>>, CacheError> {
        let mut regions = HashMap::new();
        for key in props.keys() {
            let Some(name) = key.strip_prefix(REGION_PREFIX) else {
                continue;
            };
            if name.contains("attributes") {
                continue;
            }
            let region = self.configure_region(props, name)?;
            regions.insert(name.to_owned(), region);
        }
        info!("Configured {} regions", regions.len());
        Ok(regions)
    }

    /// Build one region. A region without its own `jcs.region.<name>` entry
    /// gets the default auxiliary list.
    ///
    /// Must be called inside a tokio runtime.
    pub fn configure_region(
        &self,
        props: &HashMap<String, String>,
        name: &str,
    ) -> Result<RegionCache<K, V>, CacheError> {
        let region_key = format!("{}{}", REGION_PREFIX, name);

        let defaults = apply_properties(
            &CompositeCacheAttributes::default(),
            props,
            &format!("{}{}.", DEFAULT_REGION, CACHE_ATTRIBUTES),
        )?;
        let mut attributes =
            apply_properties(&defaults, props, &format!("{}{}.", region_key, CACHE_ATTRIBUTES))?;
        attributes.cache_name = name.to_owned();

        let element_defaults = apply_properties(
            &ElementAttributes::default(),
            props,
            &format!("{}{}.", DEFAULT_REGION, ELEMENT_ATTRIBUTES),
        )?;
        let element_attributes = apply_properties(
            &element_defaults,
            props,
            &format!("{}{}.", region_key, ELEMENT_ATTRIBUTES),
        )?;

        let aux_list = props
            .get(&region_key)
            .or_else(|| props.get(DEFAULT_REGION))
            .map(String::as_str)
            .unwrap_or("");
        debug!("Parsing region {} with auxiliaries '{}'", name, aux_list);

        let mut builder: RegionCacheBuilder<K, V> =
            RegionCache::builder(attributes).element_attributes(element_attributes);
        for aux_name in aux_list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match self.create_auxiliary(props, aux_name, name) {
                Ok((cache, aux_attributes)) => {
                    builder = builder.auxiliary(cache, aux_attributes.event_queue);
                }
                Err(e) => error!(
                    "Could not create auxiliary {} for region {}, continuing without it: {}",
                    aux_name, name, e
                ),
            }
        }
        builder.build()
    }

    fn create_auxiliary(
        &self,
        props: &HashMap<String, String>,
        aux_name: &str,
        region: &str,
    ) -> Result<(Arc<dyn AuxiliaryCache<K, V>>, AuxiliaryCacheAttributes), CacheError> {
        let factory_key = format!("{}{}", AUXILIARY_PREFIX, aux_name);
        let factory_id = props.get(&factory_key).ok_or_else(|| {
            CacheError::Configuration(format!("no factory configured for {}", factory_key))
        })?;
        let factory = self.factories.get(factory_id).ok_or_else(|| {
            CacheError::Configuration(format!("unknown auxiliary factory '{}'", factory_id))
        })?;

        let mut attributes = self.auxiliary_attributes(props, aux_name, factory.kind())?;
        attributes.cache_name = region.to_owned();

        let cache = factory.create(&attributes)?;
        debug!(
            "Created {:?} auxiliary {} for region {}",
            factory.kind(),
            aux_name,
            region
        );
        Ok((cache, attributes))
    }

    /// Registered attributes for `aux_name`, parsing them on first use.
    fn auxiliary_attributes(
        &self,
        props: &HashMap<String, String>,
        aux_name: &str,
        kind: AuxiliaryKind,
    ) -> Result<AuxiliaryCacheAttributes, CacheError> {
        let mut registry = self
            .attribute_registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(attributes) = registry.get(aux_name) {
            return Ok(attributes.clone());
        }

        let prefix = format!("{}{}{}.", AUXILIARY_PREFIX, aux_name, AUXILIARY_ATTRIBUTES);
        let base = AuxiliaryCacheAttributes {
            name: aux_name.to_owned(),
            kind,
            ..AuxiliaryCacheAttributes::default()
        };
        let (mut attributes, extra) = apply_properties_with_extra(&base, props, &prefix)?;
        attributes.name = aux_name.to_owned();
        attributes.kind = kind;
        attributes.properties = extra;

        registry.insert(aux_name.to_owned(), attributes.clone());
        Ok(attributes)
    }
}

fn apply_properties<T: Serialize + DeserializeOwned>(
    base: &T,
    props: &HashMap<String, String>,
    prefix: &str,
) -> Result<T, CacheError> {
    let (applied, extra) = apply_properties_with_extra(base, props, prefix)?;
    for name in extra.keys() {
        warn!("Unknown property {}{}, ignoring", prefix, name);
    }
    Ok(applied)
}

/// Overlay every `<prefix><Prop>` entry onto `base`. Properties that `base`
/// has no field for are handed back untouched; values the field cannot hold
/// are logged and leave the field as it was.
fn apply_properties_with_extra<T: Serialize + DeserializeOwned>(
    base: &T,
    props: &HashMap<String, String>,
    prefix: &str,
) -> Result<(T, HashMap<String, String>), CacheError> {
    let mut value = serde_json::to_value(base)?;
    let Value::Object(fields) = &mut value else {
        return Err(CacheError::Configuration(format!(
            "attributes for {} are not a struct",
            prefix
        )));
    };

    let mut extra = HashMap::new();
    for (key, raw) in props {
        let Some(name) = key.strip_prefix(prefix) else {
            continue;
        };
        let Some(current) = fields.get(name) else {
            extra.insert(name.to_owned(), raw.clone());
            continue;
        };
        let accepted = convert(current, raw).filter(|converted| {
            let mut trial = fields.clone();
            trial.insert(name.to_owned(), converted.clone());
            serde_json::from_value::<T>(Value::Object(trial)).is_ok()
        });
        match accepted {
            Some(converted) => {
                fields.insert(name.to_owned(), converted);
            }
            None => warn!("Invalid value '{}' for property {}, ignoring", raw, key),
        }
    }

    Ok((serde_json::from_value(value)?, extra))
}

/// Convert a property string to the JSON type the field currently holds.
fn convert(current: &Value, raw: &str) -> Option<Value> {
    match current {
        Value::Bool(_) => raw.parse::<bool>().ok().map(Value::Bool),
        Value::Number(_) => raw
            .parse::<u64>()
            .map(Value::from)
            .or_else(|_| raw.parse::<i64>().map(Value::from))
            .ok()
            .or_else(|| raw.parse::<f64>().ok().map(Value::from)),
        Value::String(_) => Some(Value::String(raw.to_owned())),
        // Unset optional fields; a negative number such as -1 means unset
        Value::Null => Some(match raw.parse::<i64>() {
            Ok(n) if n < 0 => Value::Null,
            _ => raw
                .parse::<u64>()
                .map(Value::from)
                .or_else(|_| raw.parse::<bool>().map(Value::Bool))
                .unwrap_or_else(|_| Value::String(raw.to_owned())),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DiskUsagePattern,
        listener::CacheStatus,
        test_support::{MapDiskBackend, RecordingTier, wait_until},
    };
    use std::time::Duration;

    const CONFIG: &str = "
# regions
jcs.default=DC
jcs.default.cacheattributes.MaxObjects=50
jcs.default.elementattributes.IsLateral=false

jcs.region.users=DC,LTCP
jcs.region.users.cacheattributes.MaxObjects=2
jcs.region.users.cacheattributes.DiskUsagePattern=Swap
jcs.region.users.elementattributes.MaxLifeSeconds=30

jcs.region.sessions=
! auxiliaries
jcs.auxiliary.DC=disk
jcs.auxiliary.DC.attributes.AllowRemoveAll=false
jcs.auxiliary.DC.attributes.IdleTimeMillis=2
jcs.auxiliary.DC.attributes.DiskPath=/tmp/regions
jcs.auxiliary.LTCP=lateral
jcs.auxiliary.LTCP.attributes.MaxFailure=7
";

    struct LateralFactory;

    impl AuxiliaryFactory<String, String> for LateralFactory {
        fn kind(&self) -> AuxiliaryKind {
            AuxiliaryKind::Lateral
        }

        fn create(
            &self,
            _attributes: &AuxiliaryCacheAttributes,
        ) -> Result<Arc<dyn AuxiliaryCache<String, String>>, CacheError> {
            Ok(Arc::new(RecordingTier::new(AuxiliaryKind::Lateral)))
        }
    }

    struct BrokenFactory;

    impl AuxiliaryFactory<String, String> for BrokenFactory {
        fn kind(&self) -> AuxiliaryKind {
            AuxiliaryKind::Remote
        }

        fn create(
            &self,
            _attributes: &AuxiliaryCacheAttributes,
        ) -> Result<Arc<dyn AuxiliaryCache<String, String>>, CacheError> {
            Err(CacheError::Configuration("remote server unreachable".to_owned()))
        }
    }

    fn configurator() -> CacheConfigurator<String, String> {
        let mut configurator = CacheConfigurator::new();
        configurator.register_factory(
            "disk",
            Arc::new(DiskCacheFactory::new(|_: &AuxiliaryCacheAttributes| {
                Ok::<_, io::Error>(MapDiskBackend::default())
            })),
        );
        configurator.register_factory("lateral", Arc::new(LateralFactory));
        configurator.register_factory("remote", Arc::new(BrokenFactory));
        configurator
    }

    #[test]
    fn test_parse_properties() {
        let props = parse_properties(
            "# comment\n! also a comment\n\n a.b = 1 \nc:two\nno separator\nd=x=y\n",
        );
        assert_eq!(props.len(), 3);
        assert_eq!(props["a.b"], "1");
        assert_eq!(props["c"], "two");
        assert_eq!(props["d"], "x=y");
    }

    #[test]
    fn test_apply_properties_converts_by_field_type() {
        let props = parse_properties(
            "p.MaxObjects=7\np.SpoolOnEvict=false\np.DiskUsagePattern=Swap\np.Bogus=1\nq.MaxObjects=9",
        );
        let attributes =
            apply_properties(&CompositeCacheAttributes::new("r"), &props, "p.").unwrap();
        assert_eq!(attributes.max_objects, 7);
        assert!(!attributes.spool_on_evict);
        assert_eq!(attributes.disk_usage_pattern, DiskUsagePattern::Swap);
        assert_eq!(attributes.cache_name, "r");

        let bad = parse_properties("p.MaxObjects=lots");
        let attributes =
            apply_properties(&CompositeCacheAttributes::new("r"), &bad, "p.").unwrap();
        assert_eq!(attributes.max_objects, 100);
    }

    #[tokio::test]
    async fn test_bad_values_keep_defaults() {
        let props = parse_properties(
            "jcs.region.good=\n\
             jcs.region.bad=\n\
             jcs.region.bad.elementattributes.MaxLifeSeconds=-1\n\
             jcs.region.bad.elementattributes.IdleTimeSeconds=soon\n\
             jcs.region.bad.cacheattributes.MaxObjects=-5\n\
             jcs.region.bad.cacheattributes.DiskUsagePattern=Sometimes\n\
             jcs.region.good.elementattributes.MaxLifeSeconds=60\n",
        );
        let regions = configurator().configure(&props).unwrap();
        assert_eq!(regions.len(), 2);

        let bad = &regions["bad"];
        assert_eq!(bad.element_attributes().max_life_seconds, None);
        assert_eq!(bad.element_attributes().idle_time_seconds, None);
        assert_eq!(bad.attributes().max_objects, 100);
        assert_eq!(bad.attributes().disk_usage_pattern, DiskUsagePattern::Update);

        assert_eq!(regions["good"].element_attributes().max_life_seconds, Some(60));
    }

    #[tokio::test]
    async fn test_configure_wires_regions_and_tiers() {
        let props = parse_properties(CONFIG);
        let configurator = configurator();
        let regions = configurator.configure(&props).unwrap();

        let mut names: Vec<_> = regions.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["sessions", "users"]);

        let users = &regions["users"];
        assert_eq!(users.name(), "users");
        assert_eq!(users.attributes().max_objects, 2);
        assert_eq!(users.attributes().disk_usage_pattern, DiskUsagePattern::Swap);
        assert!(!users.element_attributes().is_lateral);
        assert_eq!(users.element_attributes().max_life_seconds, Some(30));
        assert_eq!(users.auxiliary_count(), 2);

        let disk = &users.auxiliaries()[0];
        assert_eq!(disk.kind(), AuxiliaryKind::Disk);
        assert_eq!(disk.cache().cache_name(), "users");
        assert_eq!(disk.queue().idle_timeout(), Duration::from_millis(2));
        let lateral = &users.auxiliaries()[1];
        assert_eq!(lateral.kind(), AuxiliaryKind::Lateral);
        assert_ne!(disk.queue().listener_id(), lateral.queue().listener_id());

        // An empty list overrides the default auxiliaries
        let sessions = &regions["sessions"];
        assert_eq!(sessions.auxiliary_count(), 0);
        assert_eq!(sessions.attributes().max_objects, 50);

        let registry = configurator.attribute_registry.lock().unwrap();
        let dc = &registry["DC"];
        assert!(!dc.allow_remove_all);
        assert_eq!(dc.properties["DiskPath"], "/tmp/regions");
        assert_eq!(registry["LTCP"].event_queue.max_failure, 7);
    }

    #[tokio::test]
    async fn test_unconfigured_region_uses_defaults() {
        let props = parse_properties(CONFIG);
        let region = configurator().configure_region(&props, "orders").unwrap();

        assert_eq!(region.attributes().cache_name, "orders");
        assert_eq!(region.attributes().max_objects, 50);
        assert_eq!(region.auxiliary_count(), 1);
        assert_eq!(region.auxiliaries()[0].cache().cache_name(), "orders");

        region.put_value("k".to_owned(), "v".to_owned()).unwrap();
        assert!(region.get(&"k".to_owned()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_auxiliaries_are_skipped() {
        let props = parse_properties(
            "jcs.region.degraded=RC,MISSING,LTCP\n\
             jcs.auxiliary.RC=remote\n\
             jcs.auxiliary.MISSING=nosuchfactory\n\
             jcs.auxiliary.LTCP=lateral\n",
        );
        let region = configurator().configure_region(&props, "degraded").unwrap();

        assert_eq!(region.status(), CacheStatus::Alive);
        assert_eq!(region.auxiliary_count(), 1);
        assert_eq!(region.auxiliaries()[0].kind(), AuxiliaryKind::Lateral);

        region.put_value("k".to_owned(), "v".to_owned()).unwrap();
        assert!(wait_until(Duration::from_secs(5), || region.is_propagation_idle()).await);
        assert!(region.get(&"k".to_owned()).await.unwrap().is_some());
    }

    #[test]
    fn test_configure_outside_runtime_fails() {
        let props = parse_properties("jcs.region.r=LTCP\njcs.auxiliary.LTCP=lateral\n");
        let result = configurator().configure_region(&props, "r");
        assert!(matches!(result, Err(CacheError::Configuration(_))));
    }
}
