use crate::{
    object::{Object, ObjectType, WrappedObject},
    AmlError,
};
use alloc::{
    collections::btree_map::BTreeMap,
    string::{String, ToString},
    vec,
    vec::Vec,
};
use bit_field::BitField;
use core::{fmt, str, str::FromStr};
use log::{trace, warn};

#[derive(Clone)]
pub struct Namespace {
    root: NamespaceLevel,
}

impl Namespace {
    /// Create a new AML namespace, with the expected pre-defined objects. `\_GL` needs an OS semaphore, and so
    /// is added by the `Interpreter`.
    pub fn new() -> Namespace {
        let mut root = NamespaceLevel::new(NamespaceLevelKind::Scope);

        for seg in [*b"_GPE", *b"_SB_", *b"_SI_", *b"_PR_", *b"_TZ_"] {
            root.children.insert(NameSeg(seg), NamespaceLevel::new(NamespaceLevelKind::Scope));
        }

        /*
         * `\_OS` predates `\_OSI`, and firmware uses it to guess which OS it's talking to. Like ACPICA and the NT
         * interpreter, we claim to be `Microsoft Windows NT`, as that's the answer firmware is tested against.
         */
        root.values.insert(
            NameSeg(*b"_OS_"),
            (ObjectFlags::new(false), Object::String(b"Microsoft Windows NT".to_vec()).wrap()),
        );
        root.values.insert(NameSeg(*b"_OSI"), (ObjectFlags::new(false), Object::native_method(1, osi).wrap()));

        /*
         * `\_REV` was meant to report the supported ACPI revision, but firmware used it to detect Linux. Modern
         * Windows and Linux both report `2`, so we do the same.
         */
        root.values.insert(NameSeg(*b"_REV"), (ObjectFlags::new(false), Object::Integer(2).wrap()));

        Namespace { root }
    }

    /// Add an object directly to the root scope.
    pub(crate) fn insert_predefined(&mut self, seg: NameSeg, object: WrappedObject) {
        self.root.values.insert(seg, (ObjectFlags::new(false), object));
    }

    pub fn add_level(&mut self, path: AmlName, kind: NamespaceLevelKind) -> Result<(), AmlError> {
        let path = path.normalize()?;
        if !path.is_absolute() {
            return Err(AmlError::InvalidName(Some(path)));
        }

        // Don't try to recreate the root scope
        if path != AmlName::root() {
            let (level, last_seg) = self.get_level_for_path_mut(&path)?;

            /*
             * A scope can be opened many times (e.g. several `Scope (\_SB)` blocks across tables), so adding a
             * level that already exists is not an error.
             */
            level.children.entry(last_seg).or_insert_with(|| NamespaceLevel::new(kind));
        }

        Ok(())
    }

    pub fn remove_level(&mut self, path: AmlName) -> Result<(), AmlError> {
        let path = path.normalize()?;

        if path != AmlName::root() {
            let (level, last_seg) = self.get_level_for_path_mut(&path)?;
            level.children.remove(&last_seg);
        }

        Ok(())
    }

    pub fn insert(&mut self, path: AmlName, object: WrappedObject) -> Result<(), AmlError> {
        let path = path.normalize()?;

        let (level, last_seg) = self.get_level_for_path_mut(&path)?;
        match level.values.insert(last_seg, (ObjectFlags::new(false), object)) {
            None => Ok(()),
            Some(_) => {
                /*
                 * Real tables often define the same name twice. The new object wins, replacing whatever was
                 * there before.
                 */
                trace!("AML name collision: {}. Replacing object.", path);
                Ok(())
            }
        }
    }

    pub fn create_alias(&mut self, path: AmlName, object: WrappedObject) -> Result<(), AmlError> {
        let path = path.normalize()?;

        let (level, last_seg) = self.get_level_for_path_mut(&path)?;
        if level.values.contains_key(&last_seg) {
            return Err(AmlError::NameCollision(path));
        }
        level.values.insert(last_seg, (ObjectFlags::new(true), object));
        Ok(())
    }

    pub fn get(&self, path: AmlName) -> Result<WrappedObject, AmlError> {
        let path = path.normalize()?;

        let (level, last_seg) = self.get_level_for_path(&path)?;
        match level.values.get(&last_seg) {
            Some((_, object)) => Ok(object.clone()),
            None => Err(AmlError::ObjectDoesNotExist(path)),
        }
    }

    pub fn get_type(&self, path: AmlName) -> Result<ObjectType, AmlError> {
        Ok(self.get(path)?.typ())
    }

    /// Get the kind of the level at `path`, if there is one.
    pub fn level_kind(&self, path: &AmlName) -> Option<NamespaceLevelKind> {
        if *path == AmlName::root() {
            return Some(self.root.kind);
        }
        let (level, last_seg) = self.get_level_for_path(path).ok()?;
        level.children.get(&last_seg).map(|level| level.kind)
    }

    /// Search for an object at the given path of the namespace, applying the search rules described in §5.3 of the
    /// ACPI specification, if they are applicable. Returns the resolved name, and the handle of the first valid
    /// object, if found.
    pub fn search(&self, path: &AmlName, starting_scope: &AmlName) -> Result<(AmlName, WrappedObject), AmlError> {
        if path.search_rules_apply() {
            /*
             * A single-segment name is looked for in the starting scope, and then in each parent scope in turn
             * until we reach the root.
             */
            let mut scope = starting_scope.clone().normalize()?;
            loop {
                let name = path.resolve(&scope)?;
                if let Ok((level, last_seg)) = self.get_level_for_path(&name) {
                    if let Some((_, object)) = level.values.get(&last_seg) {
                        return Ok((name, object.clone()));
                    }
                }

                match scope.parent() {
                    Ok(parent) => scope = parent,
                    Err(AmlError::RootHasNoParent) => return Err(AmlError::ObjectDoesNotExist(path.clone())),
                    Err(err) => return Err(err),
                }
            }
        } else {
            let name = path.resolve(starting_scope)?;
            let (level, last_seg) = self.get_level_for_path(&name)?;

            match level.values.get(&last_seg) {
                Some((_, object)) => Ok((name, object.clone())),
                None => Err(AmlError::ObjectDoesNotExist(name)),
            }
        }
    }

    pub fn search_for_level(&self, level_name: &AmlName, starting_scope: &AmlName) -> Result<AmlName, AmlError> {
        if level_name.search_rules_apply() {
            let mut scope = starting_scope.clone().normalize()?;

            loop {
                let name = level_name.resolve(&scope)?;
                if let Ok((level, last_seg)) = self.get_level_for_path(&name) {
                    if level.children.contains_key(&last_seg) {
                        return Ok(name);
                    }
                }

                match scope.parent() {
                    Ok(parent) => scope = parent,
                    Err(AmlError::RootHasNoParent) => return Err(AmlError::LevelDoesNotExist(level_name.clone())),
                    Err(err) => return Err(err),
                }
            }
        } else {
            level_name.resolve(starting_scope)
        }
    }

    /// Split an absolute, normalized path into the level that contains it, and the last segment to index into
    /// that level with.
    fn get_level_for_path(&self, path: &AmlName) -> Result<(&NamespaceLevel, NameSeg), AmlError> {
        let (last_seg, levels) = path.split_for_lookup()?;

        let mut current_level = &self.root;
        for (i, segment) in levels.iter().enumerate() {
            current_level = current_level
                .children
                .get(segment)
                .ok_or_else(|| AmlError::LevelDoesNotExist(AmlName::from_segments(&levels[..=i])))?;
        }

        Ok((current_level, last_seg))
    }

    fn get_level_for_path_mut(&mut self, path: &AmlName) -> Result<(&mut NamespaceLevel, NameSeg), AmlError> {
        let (last_seg, levels) = path.split_for_lookup()?;

        let mut current_level = &mut self.root;
        for (i, segment) in levels.iter().enumerate() {
            current_level = current_level
                .children
                .get_mut(segment)
                .ok_or_else(|| AmlError::LevelDoesNotExist(AmlName::from_segments(&levels[..=i])))?;
        }

        Ok((current_level, last_seg))
    }

    /// Traverse the namespace, calling `f` on each namespace level. `f` returns a `Result<bool, AmlError>` -
    /// errors terminate the traversal and are propagated, and the `bool` on the successful path marks whether the
    /// children of the level should also be traversed.
    pub fn traverse<F>(&self, mut f: F) -> Result<(), AmlError>
    where
        F: FnMut(&AmlName, &NamespaceLevel) -> Result<bool, AmlError>,
    {
        /*
         * Walk the tree with an explicit stack of levels, so deep namespaces can't exhaust the native stack.
         */
        let mut stack: Vec<(AmlName, &NamespaceLevel)> = vec![(AmlName::root(), &self.root)];
        while let Some((name, level)) = stack.pop() {
            if f(&name, level)? {
                for (seg, child) in level.children.iter().rev() {
                    stack.push((AmlName::from_name_seg(*seg).resolve(&name)?, child));
                }
            }
        }

        Ok(())
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Namespace::new()
    }
}

/// `\_OSI` lets firmware ask whether the OS supports a feature, or behaves like a given version of Windows. We
/// follow Linux here: every Windows version is claimed, `Darwin` and `Linux` are denied, and a small set of
/// capability strings are supported.
fn osi(args: &[WrappedObject]) -> Result<WrappedObject, AmlError> {
    const WINDOWS_VERSIONS: &[&str] = &[
        "Windows 2000",
        "Windows 2001",
        "Windows 2001 SP1",
        "Windows 2001 SP2",
        "Windows 2001.1",
        "Windows 2001.1 SP1",
        "Windows 2006",
        "Windows 2006 SP1",
        "Windows 2006 SP2",
        "Windows 2006.1",
        "Windows 2009",
        "Windows 2012",
        "Windows 2013",
        "Windows 2015",
        "Windows 2016",
        "Windows 2017",
        "Windows 2017.2",
        "Windows 2018",
        "Windows 2018.2",
        "Windows 2019",
        "Windows 2020",
        "Windows 2021",
        "Windows 2022",
    ];
    const CAPABILITIES: &[&str] = &[
        "Extended Address Space Descriptor",
        "Module Device",
        "3.0 Thermal Model",
        "3.0 _SCP Extensions",
        "Processor Aggregator Device",
    ];

    let [feature] = args else {
        return Err(AmlError::MethodArgCountIncorrect);
    };
    let feature = feature.lock();
    let feature = feature.as_string()?;

    if feature == "Linux" {
        warn!("ACPI evaluated `_OSI(\"Linux\")`. This is a firmware bug. Reporting no support.");
    }
    let is_supported = WINDOWS_VERSIONS.contains(&feature) || CAPABILITIES.contains(&feature);

    Ok(Object::Integer(if is_supported { u64::MAX } else { 0 }).wrap())
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const STEM: &str = "│   ";
        const BRANCH: &str = "├── ";
        const END: &str = "└── ";

        fn print_level(f: &mut fmt::Formatter<'_>, level: &NamespaceLevel, indent: &str) -> fmt::Result {
            // Levels that don't sit under a value of the same name (e.g. `Scope`s) are printed after the values
            let orphan_levels: Vec<_> =
                level.children.iter().filter(|(name, _)| !level.values.contains_key(*name)).collect();

            for (i, (name, (flags, object))) in level.values.iter().enumerate() {
                let end = i == level.values.len() - 1 && orphan_levels.is_empty();
                write!(f, "{}{}{}: {}", indent, if end { END } else { BRANCH }, name.as_str(), {
                    if flags.is_alias() {
                        "[A] "
                    } else {
                        ""
                    }
                })?;
                match object.try_lock() {
                    Some(object) => writeln!(f, "{}", *object)?,
                    None => writeln!(f, "[Busy]")?,
                }

                if let Some(child_level) = level.children.get(name) {
                    let indent = String::from(indent) + if end { "    " } else { STEM };
                    print_level(f, child_level, &indent)?;
                }
            }

            for (i, (name, child_level)) in orphan_levels.iter().enumerate() {
                let end = i == orphan_levels.len() - 1;
                writeln!(f, "{}{}{}:", indent, if end { END } else { BRANCH }, name.as_str())?;
                let indent = String::from(indent) + if end { "    " } else { STEM };
                print_level(f, child_level, &indent)?;
            }

            Ok(())
        }

        writeln!(f, "\n    \\:")?;
        print_level(f, &self.root, "    ")
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum NamespaceLevelKind {
    Scope,
    Device,
    Processor,
    PowerResource,
    ThermalZone,
    MethodLocals,
}

#[derive(Clone)]
pub struct NamespaceLevel {
    pub kind: NamespaceLevelKind,
    pub values: BTreeMap<NameSeg, (ObjectFlags, WrappedObject)>,
    pub children: BTreeMap<NameSeg, NamespaceLevel>,
}

#[derive(Clone, Copy, Debug)]
pub struct ObjectFlags(u8);

impl ObjectFlags {
    pub fn new(is_alias: bool) -> ObjectFlags {
        let mut flags = 0;
        flags.set_bit(0, is_alias);
        ObjectFlags(flags)
    }

    pub fn is_alias(&self) -> bool {
        self.0.get_bit(0)
    }
}

impl NamespaceLevel {
    pub fn new(kind: NamespaceLevelKind) -> NamespaceLevel {
        NamespaceLevel { kind, values: BTreeMap::new(), children: BTreeMap::new() }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct AmlName(Vec<NameComponent>);

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum NameComponent {
    Root,
    Prefix,
    Segment(NameSeg),
}

impl AmlName {
    pub fn root() -> AmlName {
        AmlName(vec![NameComponent::Root])
    }

    pub fn from_name_seg(seg: NameSeg) -> AmlName {
        AmlName(vec![NameComponent::Segment(seg)])
    }

    pub fn from_components(components: Vec<NameComponent>) -> AmlName {
        AmlName(components)
    }

    fn from_segments(segments: &[NameSeg]) -> AmlName {
        let mut name = AmlName::root();
        name.0.extend(segments.iter().map(|seg| NameComponent::Segment(*seg)));
        name
    }

    pub fn as_string(&self) -> String {
        self.0
            .iter()
            .fold(String::new(), |name, component| match component {
                NameComponent::Root => name + "\\",
                NameComponent::Prefix => name + "^",
                NameComponent::Segment(seg) => name + seg.as_str() + ".",
            })
            .trim_end_matches('.')
            .to_string()
    }

    /// An AML path is normal if it does not contain any prefix elements ("^" characters, when
    /// expressed as a string).
    pub fn is_normal(&self) -> bool {
        !self.0.contains(&NameComponent::Prefix)
    }

    pub fn is_absolute(&self) -> bool {
        self.0.first() == Some(&NameComponent::Root)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Special rules apply when searching for certain paths (specifically, those that are made up
    /// of a single name segment). Returns `true` if those rules apply.
    pub fn search_rules_apply(&self) -> bool {
        matches!(self.0[..], [NameComponent::Segment(_)])
    }

    /// Whether this (absolute, normalized) path is `scope` or lies somewhere below it.
    pub fn is_within(&self, scope: &AmlName) -> bool {
        self.0.starts_with(&scope.0)
    }

    pub fn last_segment(&self) -> Option<NameSeg> {
        match self.0.last() {
            Some(NameComponent::Segment(seg)) => Some(*seg),
            _ => None,
        }
    }

    /// Normalize an AML path, resolving prefix chars. Returns `AmlError::InvalidNormalizedName` if the path
    /// normalizes to an invalid path (e.g. `\^_FOO`)
    pub fn normalize(self) -> Result<AmlName, AmlError> {
        if self.is_normal() {
            return Ok(self);
        }

        let mut normalized = Vec::with_capacity(self.0.len());
        for component in &self.0 {
            match component {
                NameComponent::Prefix => match normalized.last() {
                    Some(NameComponent::Segment(_)) => {
                        normalized.pop();
                    }
                    _ => return Err(AmlError::InvalidNormalizedName(self.clone())),
                },
                other => normalized.push(*other),
            }
        }
        Ok(AmlName(normalized))
    }

    /// Get the parent of this `AmlName`. For example, the parent of `\_SB.PCI0._PRT` is `\_SB.PCI0`. The root
    /// path has no parent, and so returns `RootHasNoParent`.
    pub fn parent(&self) -> Result<AmlName, AmlError> {
        let mut normalized_self = self.clone().normalize()?;

        match normalized_self.0.last() {
            None | Some(NameComponent::Root) => Err(AmlError::RootHasNoParent),
            Some(_) => {
                normalized_self.0.pop();
                Ok(normalized_self)
            }
        }
    }

    /// Resolve this path against a given scope, making it absolute. If the path is absolute, it is
    /// returned directly. The path is also normalized.
    pub fn resolve(&self, scope: &AmlName) -> Result<AmlName, AmlError> {
        if self.is_absolute() {
            return self.clone().normalize();
        }
        if !scope.is_absolute() {
            return Err(AmlError::InvalidName(Some(scope.clone())));
        }

        let mut resolved_path = scope.clone();
        resolved_path.0.extend_from_slice(&(self.0));
        resolved_path.normalize()
    }

    /// Split an absolute, normalized path into its last segment and the segments of the levels leading to it.
    fn split_for_lookup(&self) -> Result<(NameSeg, Vec<NameSeg>), AmlError> {
        let Some((NameComponent::Root, rest)) = self.0.split_first() else {
            return Err(AmlError::InvalidName(Some(self.clone())));
        };

        let mut segments = Vec::with_capacity(rest.len());
        for component in rest {
            match component {
                NameComponent::Segment(seg) => segments.push(*seg),
                _ => return Err(AmlError::InvalidName(Some(self.clone()))),
            }
        }

        match segments.pop() {
            Some(last_seg) => Ok((last_seg, segments)),
            // The root itself can't be looked up as a value
            None => Err(AmlError::InvalidName(Some(self.clone()))),
        }
    }
}

impl FromStr for AmlName {
    type Err = AmlError;

    fn from_str(mut string: &str) -> Result<Self, Self::Err> {
        if string.is_empty() {
            return Err(AmlError::EmptyNamesAreInvalid);
        }

        let mut components = Vec::new();

        if string.starts_with('\\') {
            components.push(NameComponent::Root);
            string = &string[1..];
        }

        if !string.is_empty() {
            for mut part in string.split('.') {
                while part.starts_with('^') {
                    components.push(NameComponent::Prefix);
                    part = &part[1..];
                }

                components.push(NameComponent::Segment(NameSeg::from_str(part)?));
            }
        }

        Ok(Self(components))
    }
}

impl fmt::Display for AmlName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NameSeg(pub(crate) [u8; 4]);

impl NameSeg {
    pub fn from_str(string: &str) -> Result<NameSeg, AmlError> {
        let bytes = string.as_bytes();
        if bytes.is_empty() || bytes.len() > 4 {
            return Err(AmlError::InvalidNameSeg([0xff, 0xff, 0xff, 0xff]));
        }

        // Short segments are padded with `_`
        let mut seg = [b'_'; 4];
        seg[..bytes.len()].copy_from_slice(bytes);
        NameSeg::from_bytes(seg)
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Result<NameSeg, AmlError> {
        if !is_lead_name_char(bytes[0]) || !bytes[1..].iter().all(|&c| is_name_char(c)) {
            return Err(AmlError::InvalidNameSeg(bytes));
        }
        Ok(NameSeg(bytes))
    }

    pub fn as_str(&self) -> &str {
        // Segments are validated to be ASCII when constructed
        str::from_utf8(&self.0).unwrap_or("????")
    }
}

pub fn is_lead_name_char(c: u8) -> bool {
    c.is_ascii_uppercase() || c == b'_'
}

pub fn is_name_char(c: u8) -> bool {
    is_lead_name_char(c) || c.is_ascii_digit()
}

impl fmt::Debug for NameSeg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aml_name_from_str() {
        assert_eq!(AmlName::from_str(""), Err(AmlError::EmptyNamesAreInvalid));
        assert_eq!(AmlName::from_str("\\"), Ok(AmlName::root()));
        assert_eq!(
            AmlName::from_str("\\_SB.PCI0"),
            Ok(AmlName(vec![
                NameComponent::Root,
                NameComponent::Segment(NameSeg(*b"_SB_")),
                NameComponent::Segment(NameSeg(*b"PCI0"))
            ]))
        );
        assert_eq!(
            AmlName::from_str("^^FOO"),
            Ok(AmlName(vec![
                NameComponent::Prefix,
                NameComponent::Prefix,
                NameComponent::Segment(NameSeg(*b"FOO_"))
            ]))
        );
        assert!(AmlName::from_str("\\1BAD").is_err());
    }

    #[test]
    fn test_normalization() {
        assert_eq!(
            AmlName::from_str("\\_SB.PCI0.^BUS.^^FOO").unwrap().normalize(),
            AmlName::from_str("\\FOO")
        );
        assert_eq!(
            AmlName::from_str("\\^FOO").unwrap().normalize(),
            Err(AmlError::InvalidNormalizedName(AmlName::from_str("\\^FOO").unwrap()))
        );
    }

    #[test]
    fn test_parent() {
        assert_eq!(AmlName::root().parent(), Err(AmlError::RootHasNoParent));
        assert_eq!(AmlName::from_str("\\_SB.PCI0").unwrap().parent(), AmlName::from_str("\\_SB"));
        assert_eq!(AmlName::from_str("\\_SB").unwrap().parent(), Ok(AmlName::root()));
    }

    #[test]
    fn test_resolve() {
        let scope = AmlName::from_str("\\_SB.PCI0").unwrap();
        assert_eq!(AmlName::from_str("^FOO").unwrap().resolve(&scope), AmlName::from_str("\\_SB.FOO"));
        assert_eq!(AmlName::from_str("\\BAR").unwrap().resolve(&scope), AmlName::from_str("\\BAR"));
        assert_eq!(AmlName::from_str("BAR.BAZ").unwrap().resolve(&scope), AmlName::from_str("\\_SB.PCI0.BAR.BAZ"));
    }

    #[test]
    fn test_search() {
        let mut namespace = Namespace::new();
        namespace.add_level(AmlName::from_str("\\_SB.PCI0").unwrap(), NamespaceLevelKind::Device).unwrap();
        namespace.insert(AmlName::from_str("\\_SB.FOO").unwrap(), Object::Integer(7).wrap()).unwrap();
        namespace.insert(AmlName::from_str("\\_SB.PCI0.FOO").unwrap(), Object::Integer(8).wrap()).unwrap();

        let (name, object) =
            namespace.search(&AmlName::from_str("FOO").unwrap(), &AmlName::from_str("\\_SB.PCI0").unwrap()).unwrap();
        assert_eq!(name, AmlName::from_str("\\_SB.PCI0.FOO").unwrap());
        assert_eq!(object.lock().as_integer(), Ok(8));

        // `_REV` is only defined at the root, and is found by searching upwards
        let (name, _) =
            namespace.search(&AmlName::from_str("_REV").unwrap(), &AmlName::from_str("\\_SB.PCI0").unwrap()).unwrap();
        assert_eq!(name, AmlName::from_str("\\_REV").unwrap());

        // Multi-segment names don't use the search rules
        assert!(namespace
            .search(&AmlName::from_str("PCI0.FOO").unwrap(), &AmlName::from_str("\\_GPE").unwrap())
            .is_err());
    }

    #[test]
    fn test_root_is_not_a_value() {
        let mut namespace = Namespace::new();
        assert!(namespace.insert(AmlName::root(), Object::Integer(0).wrap()).is_err());
        assert!(namespace.get(AmlName::root()).is_err());
    }

    #[test]
    fn test_alias_collision() {
        let mut namespace = Namespace::new();
        let object = Object::Integer(3).wrap();
        namespace.insert(AmlName::from_str("\\FOO").unwrap(), object.clone()).unwrap();
        namespace.create_alias(AmlName::from_str("\\BAR").unwrap(), object.clone()).unwrap();
        assert_eq!(
            namespace.create_alias(AmlName::from_str("\\FOO").unwrap(), object),
            Err(AmlError::NameCollision(AmlName::from_str("\\FOO").unwrap()))
        );
        assert_eq!(namespace.get_type(AmlName::from_str("\\BAR").unwrap()), Ok(ObjectType::Integer));
    }

    #[test]
    fn test_traverse_visits_nested_levels() {
        let mut namespace = Namespace::new();
        namespace.add_level(AmlName::from_str("\\_SB.PCI0").unwrap(), NamespaceLevelKind::Device).unwrap();
        namespace.add_level(AmlName::from_str("\\_SB.PCI0.ISA_").unwrap(), NamespaceLevelKind::Device).unwrap();

        let mut devices = Vec::new();
        namespace
            .traverse(|name, level| {
                if level.kind == NamespaceLevelKind::Device {
                    devices.push(name.clone());
                }
                Ok(true)
            })
            .unwrap();
        assert_eq!(
            devices,
            vec![AmlName::from_str("\\_SB.PCI0").unwrap(), AmlName::from_str("\\_SB.PCI0.ISA_").unwrap()]
        );
    }

    #[test]
    fn test_osi() {
        let namespace = Namespace::new();
        let osi = namespace.get(AmlName::from_str("\\_OSI").unwrap()).unwrap();
        let osi = osi.lock();
        let Object::NativeMethod { ref f, .. } = *osi else { panic!() };
        assert_eq!(f(&[Object::String("Windows 2015".into()).wrap()]).unwrap().lock().as_integer(), Ok(u64::MAX));
        assert_eq!(f(&[Object::String("Linux".into()).wrap()]).unwrap().lock().as_integer(), Ok(0));
        assert_eq!(f(&[]).err(), Some(AmlError::MethodArgCountIncorrect));
    }
}
