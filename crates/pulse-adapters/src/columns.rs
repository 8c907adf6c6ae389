//! Header aliasing from source CSV columns onto canonical field names.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const EMPLOYEE_ID: &str = "employee_id";
pub const NAME: &str = "name";
pub const CORPORATE_EMAIL: &str = "corporate_email";
pub const DEPARTMENT: &str = "department";
pub const ROLE: &str = "role";
pub const FUNCTION: &str = "function";
pub const LOCATION: &str = "location";
pub const TENURE: &str = "tenure";
pub const PHONE: &str = "phone";
pub const GENDER: &str = "gender";
pub const GENERATION: &str = "generation";
pub const RESPONSE_DATE: &str = "response_date";
pub const SURVEY_PERIOD: &str = "survey_period";
pub const SCORE: &str = "score";
pub const COMMENT: &str = "comment";

/// Likert dimensions, each scored 1..=5.
pub const DIMENSIONS: [&str; 7] = [
    "role_interest",
    "contribution",
    "learning",
    "feedback",
    "manager_interaction",
    "career_clarity",
    "permanence",
];

/// Free-text remark per Likert dimension: (canonical column, dimension).
pub const DIMENSION_COMMENTS: [(&str, &str); 7] = [
    ("role_interest_comment", "role_interest"),
    ("contribution_comment", "contribution"),
    ("learning_comment", "learning"),
    ("feedback_comment", "feedback"),
    ("manager_interaction_comment", "manager_interaction"),
    ("career_clarity_comment", "career_clarity"),
    ("permanence_comment", "permanence"),
];

/// Organization hierarchy, top down: (canonical column, level name).
pub const ORG_LEVELS: [(&str, &str); 5] = [
    ("org_company", "company"),
    ("org_directorate", "directorate"),
    ("org_management", "management"),
    ("org_coordination", "coordination"),
    ("org_area", "area"),
];

const DEFAULT_ALIASES: &[(&str, &[&str])] = &[
    (EMPLOYEE_ID, &["email", "employee_email"]),
    (NAME, &["nome"]),
    (CORPORATE_EMAIL, &["email_corporativo"]),
    (DEPARTMENT, &["area", "departamento"]),
    (ROLE, &["cargo"]),
    (FUNCTION, &["funcao", "função"]),
    (LOCATION, &["localidade"]),
    (TENURE, &["tempo_de_empresa"]),
    (PHONE, &["celular", "telefone"]),
    (GENDER, &["genero", "gênero"]),
    (GENERATION, &["geracao", "geração"]),
    ("org_company", &["n0_empresa"]),
    ("org_directorate", &["n1_diretoria"]),
    ("org_management", &["n2_gerencia"]),
    ("org_coordination", &["n3_coordenacao"]),
    ("org_area", &["n4_area"]),
    (RESPONSE_DATE, &["Data da Resposta", "data_resposta"]),
    (SURVEY_PERIOD, &["periodo", "period"]),
    (SCORE, &["eNPS", "enps_score"]),
    (COMMENT, &["[Aberta] eNPS", "enps_comment", "comentario"]),
    ("role_interest", &["Interesse no Cargo"]),
    ("contribution", &["Contribuição"]),
    ("learning", &["Aprendizado e Desenvolvimento"]),
    ("feedback", &["Feedback"]),
    ("manager_interaction", &["Interação com Gestor"]),
    ("career_clarity", &["Clareza sobre Possibilidades de Carreira"]),
    ("permanence", &["Expectativa de Permanência"]),
    ("role_interest_comment", &["Comentários - Interesse no Cargo"]),
    ("contribution_comment", &["Comentários - Contribuição"]),
    ("learning_comment", &["Comentários - Aprendizado e Desenvolvimento"]),
    ("feedback_comment", &["Comentários - Feedback"]),
    ("manager_interaction_comment", &["Comentários - Interação com Gestor"]),
    ("career_clarity_comment", &["Comentários - Clareza sobre Possibilidades de Carreira"]),
    ("permanence_comment", &["Comentários - Expectativa de Permanência"]),
];

fn fold(header: &str) -> String {
    header.trim().to_lowercase()
}

#[derive(Debug, Deserialize)]
struct ColumnsFile {
    #[serde(default)]
    columns: BTreeMap<String, Vec<String>>,
}

/// Case-insensitive map from source header to canonical field.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    by_header: HashMap<String, &'static str>,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        let mut by_header = HashMap::new();
        for (canonical, aliases) in DEFAULT_ALIASES {
            by_header.insert(fold(canonical), *canonical);
            for alias in *aliases {
                by_header.insert(fold(alias), *canonical);
            }
        }
        Self { by_header }
    }
}

impl ColumnMapping {
    /// Defaults plus extra aliases from YAML of the form `columns: { comment: [...] }`.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: ColumnsFile = serde_yaml::from_str(yaml).context("parsing column aliases")?;
        let mut mapping = Self::default();
        for (canonical, aliases) in file.columns {
            let Some(canonical) = canonical_name(&canonical) else {
                bail!("unknown canonical column `{canonical}`");
            };
            for alias in aliases {
                mapping.by_header.insert(fold(&alias), canonical);
            }
        }
        Ok(mapping)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading column aliases {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("loading {}", path.display()))
    }

    pub fn canonical_for(&self, header: &str) -> Option<&'static str> {
        self.by_header.get(&fold(header)).copied()
    }
}

fn canonical_name(name: &str) -> Option<&'static str> {
    DEFAULT_ALIASES
        .iter()
        .map(|(canonical, _)| *canonical)
        .find(|canonical| *canonical == name)
}
