//! Employee roster handed to a camera job.
//!
//! The job runner writes one JSON file per camera, keyed by employee ID:
//!
//! ```json
//! { "17": { "empId": "17", "empName": "Ada Lovelace", "images": ["./images/ada.jpg"] } }
//! ```
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A known person and the reference images of their face.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Employee {
    pub emp_id: String,
    pub emp_name: String,
    #[serde(default)]
    pub emp_user_name: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// All employees expected in front of one camera.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Roster {
    employees: BTreeMap<String, Employee>,
}

impl Roster {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read roster {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("invalid roster {}", path.display()))
    }

    /// Build a roster from a flat directory of face images.
    ///
    /// Every file is one employee, ID and name are the file stem.
    pub fn from_image_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && path.extension().is_some())
            .collect();
        paths.sort();

        log::info!("{} encoding images found", paths.len());

        let mut employees = BTreeMap::new();
        for path in paths {
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            employees
                .entry(stem.to_owned())
                .or_insert_with(|| Employee {
                    emp_id: stem.to_owned(),
                    emp_name: stem.to_owned(),
                    emp_user_name: None,
                    images: Vec::with_capacity(1),
                })
                .images
                .push(path.to_string_lossy().into_owned());
        }

        Ok(Self { employees })
    }

    pub fn insert(&mut self, employee: Employee) {
        self.employees.insert(employee.emp_id.clone(), employee);
    }

    pub fn len(&self) -> usize {
        self.employees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.employees.is_empty()
    }

    pub fn get(&self, emp_id: &str) -> Option<&Employee> {
        self.employees
            .get(emp_id)
            .or_else(|| self.employees.values().find(|emp| emp.emp_id == emp_id))
    }

    /// Name to print next to a recognized face.
    pub fn display_name(&self, emp_id: &str) -> Option<&str> {
        self.get(emp_id).map(|emp| emp.emp_name.as_str())
    }

    /// All `(emp_id, image_path)` pairs.
    pub fn reference_images(&self) -> impl Iterator<Item = (&str, &str)> {
        self.employees.values().flat_map(|emp| {
            emp.images
                .iter()
                .map(move |image| (emp.emp_id.as_str(), image.as_str()))
        })
    }
}

#[cfg(test)]
mod test {

    use super::*;

    const ROSTER: &str = r#"{
        "17": {
            "empName": "Ada Lovelace",
            "empUserName": "ada",
            "empId": "17",
            "images": ["./images/ada-1.jpg", "./images/ada-2.jpg"]
        },
        "legacy-key": {
            "empName": "Alan Turing",
            "empId": "23",
            "images": ["./images/alan.png"]
        }
    }"#;

    #[test]
    fn test_parse_roster() -> Result<()> {
        let roster = Roster::from_json(ROSTER)?;

        assert_eq!(roster.len(), 2);
        assert_eq!(roster.display_name("17"), Some("Ada Lovelace"));
        assert_eq!(
            roster.get("17").and_then(|emp| emp.emp_user_name.as_deref()),
            Some("ada")
        );

        Ok(())
    }

    #[test]
    fn test_display_name_falls_back_to_emp_id_field() -> Result<()> {
        let roster = Roster::from_json(ROSTER)?;

        assert_eq!(roster.display_name("23"), Some("Alan Turing"));
        assert_eq!(roster.display_name("99"), None);

        Ok(())
    }

    #[test]
    fn test_reference_images() -> Result<()> {
        let roster = Roster::from_json(ROSTER)?;
        let images: Vec<_> = roster.reference_images().collect();

        assert_eq!(
            images,
            vec![
                ("17", "./images/ada-1.jpg"),
                ("17", "./images/ada-2.jpg"),
                ("23", "./images/alan.png"),
            ]
        );

        Ok(())
    }

    #[test]
    fn test_from_image_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("grace.jpg"), b"not really a jpeg")?;
        fs::write(dir.path().join("linus.png"), b"nor a png")?;
        fs::create_dir(dir.path().join("nested"))?;

        let roster = Roster::from_image_dir(dir.path())?;

        assert_eq!(roster.len(), 2);
        assert_eq!(roster.display_name("grace"), Some("grace"));
        assert!(roster
            .reference_images()
            .any(|(id, path)| id == "linus" && path.ends_with("linus.png")));

        Ok(())
    }

    #[test]
    fn test_missing_roster_file() {
        assert!(Roster::from_path("/definitely/not/here.json").is_err());
    }
}
