//! Expansion of heterogeneous parcel property bags into a lookup-friendly
//! superset, plus a typed canonical view over the same data.
//!
//! Source datasets spell the same attribute many ways (`Prenom_001`,
//! `prenom_1`, `Prénom01`, `region_col`, ...). [`normalize_properties`]
//! exposes every spelling under a predictable set of aliases without ever
//! replacing a populated value, and [`canonical_view`] folds the bag into
//! mandataire/affectataire records.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::errors::ParseError;

pub type PropertyBag = Map<String, Value>;

pub const MAX_INDEXED_AFFECTATAIRES: usize = 27;

static PRENOM_INDEXED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|_)prenom[_-]?0*(\d{1,3})$").expect("prenom pattern"));
static NOM_INDEXED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|_)nom[_-]?0*(\d{1,3})$").expect("nom pattern"));
static TRAILING_INDEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3})$").expect("trailing index pattern"));

static COLLECTIVE_KEYS: Lazy<Vec<String>> = Lazy::new(|| {
    let mut keys: Vec<String> = [
        "Prenom_M",
        "Nom_M",
        "Cas_de_Personne_001",
        "Quel_est_le_nombre_d_affectata",
    ]
    .iter()
    .map(|k| k.to_string())
    .collect();
    keys.extend((1..=MAX_INDEXED_AFFECTATAIRES).map(|i| format!("Prenom_{i:03}")));
    keys.extend((1..=MAX_INDEXED_AFFECTATAIRES).map(|i| format!("Nom_{i:03}")));
    keys.extend(
        [
            "grappeSenegal",
            "regionSenegal",
            "departmentSenegal",
            "arrondissementSenegal",
            "communeSenegal",
            "Village",
            "Of",
            "Enqueteur",
        ]
        .iter()
        .map(|k| k.to_string()),
    );
    keys
});

/// Administrative-division aliases: a folded key containing any needle is
/// also exposed under the canonical name.
const DIVISION_ALIASES: &[(&[&str], &str)] = &[
    (&["region"], "regionSenegal"),
    (&["depart"], "departmentSenegal"),
    (&["arrond"], "arrondissementSenegal"),
    (&["commune"], "communeSenegal"),
    (&["village"], "Village"),
    (&["grappe"], "grappeSenegal"),
    (&["vocation"], "Vocation"),
    (&["type_usa", "typeusa", "usage"], "type_usag"),
];

pub fn parse_properties(raw: &str) -> Result<PropertyBag, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }
    match serde_json::from_str::<Value>(trimmed)? {
        Value::Object(map) => Ok(map),
        // Some exports double-encode the blob.
        Value::String(inner) => match serde_json::from_str::<Value>(&inner)? {
            Value::Object(map) => Ok(map),
            other => Err(ParseError::NotAnObject(json_kind(&other))),
        },
        other => Err(ParseError::NotAnObject(json_kind(&other))),
    }
}

/// Parses a stored blob, logging and recovering to an empty bag on failure.
pub fn properties_or_empty(raw: Option<&str>) -> PropertyBag {
    let Some(raw) = raw else {
        return PropertyBag::new();
    };
    match parse_properties(raw) {
        Ok(bag) => bag,
        Err(ParseError::Empty) => PropertyBag::new(),
        Err(err) => {
            warn!(target: "properties", error = %err, "unreadable properties blob; using empty map");
            PropertyBag::new()
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn normalize_properties(raw: &PropertyBag) -> PropertyBag {
    let mut expanded = raw.clone();
    // Aliases of aliases may surface new spellings; stop once a pass is a no-op.
    while expand_once(&mut expanded) {}
    expanded
}

fn expand_once(bag: &mut PropertyBag) -> bool {
    let mut changed = false;
    let snapshot: Vec<(String, Value)> = bag.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

    for (key, value) in &snapshot {
        changed |= offer(bag, key.to_lowercase(), value);
        changed |= offer(bag, fold_key(key), value);
        changed |= offer(bag, key.replace(['_', '-'], ""), value);
        if let Some(base) = strip_legacy_suffix(key) {
            changed |= offer(bag, base.to_string(), value);
        }
    }

    for (key, value) in &snapshot {
        let folded = fold_key(key);
        if let Some(idx) = indexed_suffix(&PRENOM_INDEXED, &folded) {
            changed |= offer(bag, format!("Prenom_{idx:03}"), value);
            changed |= offer(bag, format!("prenom_{idx:03}"), value);
        }
        if let Some(idx) = indexed_suffix(&NOM_INDEXED, &folded) {
            changed |= offer(bag, format!("Nom_{idx:03}"), value);
            changed |= offer(bag, format!("nom_{idx:03}"), value);
        }
        for (needles, canonical) in DIVISION_ALIASES {
            if needles.iter().any(|needle| folded.contains(needle)) {
                changed |= offer(bag, (*canonical).to_string(), value);
            }
        }
    }
    changed
}

/// Inserts `key` unless it already holds a non-null value.
fn offer(bag: &mut PropertyBag, key: String, value: &Value) -> bool {
    if key.is_empty() {
        return false;
    }
    match bag.get_mut(&key) {
        Some(existing) if existing.is_null() && !value.is_null() => {
            *existing = value.clone();
            true
        }
        Some(_) => false,
        None => {
            bag.insert(key, value.clone());
            true
        }
    }
}

fn indexed_suffix(pattern: &Regex, folded: &str) -> Option<u32> {
    let idx: u32 = pattern.captures(folded)?.get(1)?.as_str().parse().ok()?;
    (idx > 0).then_some(idx)
}

fn strip_legacy_suffix(key: &str) -> Option<&str> {
    let lower = key.to_ascii_lowercase();
    if (lower.ends_with("_col") || lower.ends_with("_ind")) && key.len() > 4 {
        Some(key[..key.len() - 4].trim())
    } else {
        None
    }
}

pub fn strip_diacritics(input: &str) -> String {
    input.nfd().filter(|c| !is_combining_mark(*c)).collect()
}

fn fold_key(key: &str) -> String {
    strip_diacritics(key).to_lowercase()
}

pub fn collective_keys() -> &'static [String] {
    &COLLECTIVE_KEYS
}

pub fn ensure_collective_keys(bag: &mut PropertyBag) {
    for key in COLLECTIVE_KEYS.iter() {
        if !bag.contains_key(key) {
            bag.insert(key.clone(), Value::Null);
        }
    }
}

/// Renders a scalar as display text; empty strings and compound values yield `None`.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Mandataire {
    pub prenom: Option<String>,
    pub nom: Option<String>,
    pub date_naiss: Option<String>,
    pub lieu: Option<String>,
    pub telephone: Option<String>,
    pub denominat: Option<String>,
    pub cas_de_personne: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Affectataire {
    pub index: u32,
    pub prenom: Option<String>,
    pub nom: Option<String>,
    pub date_naiss: Option<String>,
    pub sexe: Option<String>,
    pub numero_piece: Option<String>,
    pub telephone: Option<String>,
    pub residence: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdministrativeDivisions {
    pub region: Option<String>,
    pub department: Option<String>,
    pub arrondissement: Option<String>,
    pub commune: Option<String>,
    pub village: Option<String>,
    pub grappe: Option<String>,
    pub vocation: Option<String>,
    pub usage_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CanonicalProperties {
    pub mandataire: Mandataire,
    pub affectataires: Vec<Affectataire>,
    pub affectataires_count: usize,
    pub divisions: AdministrativeDivisions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PersonField {
    Prenom,
    Nom,
    DateNaiss,
    Sexe,
    NumeroPiece,
    Telephone,
    Residence,
}

impl PersonField {
    fn classify(compact: &str) -> Option<Self> {
        if compact.contains("prenom") {
            Some(Self::Prenom)
        } else if compact.contains("nom") && !compact.contains("nombre") {
            Some(Self::Nom)
        } else if compact.contains("dat") && compact.contains("nai") {
            Some(Self::DateNaiss)
        } else if compact.contains("sex") {
            Some(Self::Sexe)
        } else if compact.contains("num") && compact.contains("piec") {
            Some(Self::NumeroPiece)
        } else if compact.contains("telephon") {
            Some(Self::Telephone)
        } else if compact.contains("resid") {
            Some(Self::Residence)
        } else {
            None
        }
    }
}

impl Affectataire {
    fn slot(&mut self, field: PersonField) -> &mut Option<String> {
        match field {
            PersonField::Prenom => &mut self.prenom,
            PersonField::Nom => &mut self.nom,
            PersonField::DateNaiss => &mut self.date_naiss,
            PersonField::Sexe => &mut self.sexe,
            PersonField::NumeroPiece => &mut self.numero_piece,
            PersonField::Telephone => &mut self.telephone,
            PersonField::Residence => &mut self.residence,
        }
    }
}

const COUNT_KEYS: &[&str] = &[
    "Quel_est_le_nombre_d_affectata",
    "Quel_est_le_nombre_d_affectata_001",
    "nombre_affectataires",
];

/// Folds a raw property bag into typed mandataire and affectataire records.
///
/// Indexed keys (`prenom_001`, `Nom2`, `Date_nai3`) land in the matching
/// affectataire slot; newline-separated aggregates fill slots in order
/// without overriding indexed values.
pub fn canonical_view(raw: &PropertyBag) -> CanonicalProperties {
    let mut cleaned = PropertyBag::new();
    for (key, value) in raw {
        let base = strip_col_suffix(key).to_string();
        if !cleaned.contains_key(&base) {
            cleaned.insert(base, value.clone());
        }
    }

    let mut mandataire = Mandataire::default();
    let mut slots: BTreeMap<u32, Affectataire> = BTreeMap::new();

    for (key, value) in &cleaned {
        let Some(text) = value_text(value) else {
            continue;
        };
        let compact = compact_key(key);

        if compact.contains("cas_de_personne") || compact.contains("casdepersonne") {
            mandataire.cas_de_personne.get_or_insert(text);
            continue;
        }
        if COUNT_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key)) {
            continue;
        }
        if compact == "prenom_m"
            || compact.starts_with("prenomm")
            || (compact.contains("mandataire") && compact.contains("prenom"))
        {
            mandataire.prenom = Some(text);
            continue;
        }
        if compact == "nom_m"
            || compact.starts_with("nomm")
            || (compact.contains("mandataire") && compact.contains("nom"))
        {
            mandataire.nom = Some(text);
            continue;
        }
        let mandataire_marked =
            compact.ends_with("_m") || compact.contains("mand") || compact.contains("mndt");
        if compact.contains("date") && compact.contains("nais") && mandataire_marked {
            mandataire.date_naiss = Some(text);
            continue;
        }
        if compact.contains("lieu") && compact.contains("nai") {
            mandataire.lieu.get_or_insert(text);
            continue;
        }
        let trailing = TRAILING_INDEX
            .captures(key)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok());
        if compact.contains("telephon") {
            if mandataire_marked || compact == "telephon2" {
                mandataire.telephone.get_or_insert(text);
                continue;
            }
            if trailing.is_none() && !text.contains('\n') && mandataire.telephone.is_none() {
                mandataire.telephone = Some(text);
                continue;
            }
        }

        if let Some(idx) = trailing.filter(|idx| *idx > 0) {
            if let Some(field) = PersonField::classify(&compact) {
                let slot = slots.entry(idx).or_insert_with(|| Affectataire {
                    index: idx,
                    ..Affectataire::default()
                });
                *slot.slot(field) = Some(text);
            }
            continue;
        }

        if text.contains('\n') {
            if let Some(field) = PersonField::classify(&compact) {
                let parts = text.split('\n').map(str::trim).filter(|p| !p.is_empty());
                for (offset, part) in parts.enumerate() {
                    let idx = offset as u32 + 1;
                    let slot = slots.entry(idx).or_insert_with(|| Affectataire {
                        index: idx,
                        ..Affectataire::default()
                    });
                    slot.slot(field).get_or_insert_with(|| part.to_string());
                }
                continue;
            }
        }

        match compact.as_str() {
            "prenom" => {
                mandataire.prenom.get_or_insert(text);
            }
            "nom" => {
                mandataire.nom.get_or_insert(text);
            }
            _ if compact.contains("denomin") => {
                mandataire.denominat.get_or_insert(text);
            }
            _ => {}
        }
    }

    let affectataires: Vec<Affectataire> = slots.into_values().collect();
    let declared = COUNT_KEYS
        .iter()
        .find_map(|k| cleaned.get(*k).or_else(|| raw.get(*k)).and_then(count_value));
    let affectataires_count = declared
        .filter(|count| *count > 0)
        .unwrap_or(affectataires.len());

    CanonicalProperties {
        mandataire,
        affectataires,
        affectataires_count,
        divisions: divisions_of(&normalize_properties(raw)),
    }
}

fn divisions_of(normalized: &PropertyBag) -> AdministrativeDivisions {
    let text = |key: &str| normalized.get(key).and_then(value_text);
    AdministrativeDivisions {
        region: text("regionSenegal"),
        department: text("departmentSenegal"),
        arrondissement: text("arrondissementSenegal"),
        commune: text("communeSenegal"),
        village: text("Village"),
        grappe: text("grappeSenegal"),
        vocation: text("Vocation"),
        usage_type: text("type_usag"),
    }
}

fn count_value(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse::<usize>().ok(),
        _ => None,
    }
}

fn strip_col_suffix(key: &str) -> &str {
    if key.len() > 4 && key.to_ascii_lowercase().ends_with("_col") {
        key[..key.len() - 4].trim()
    } else {
        key.trim()
    }
}

fn compact_key(key: &str) -> String {
    fold_key(key)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}
