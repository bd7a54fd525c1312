use crate::config::{ConfigBackend, Configuration};
use anyhow::{Context, Error};
use std::path::Path;
use std::str::FromStr;
use toml_edit::DocumentMut;

#[derive(Debug, Clone, Default)]
pub struct TomlConfiguration {
    document: DocumentMut,
}

impl TomlConfiguration {
    fn read<P: AsRef<Path>>(file: P) -> Result<Self, Error> {
        let file = file.as_ref();
        let content =
            std::fs::read_to_string(file).context(format!("Reading configuration {}", file.display()))?;
        let document =
            DocumentMut::from_str(&content).context(format!("Parsing configuration {}", file.display()))?;
        Ok(Self { document })
    }

    fn write<P: AsRef<Path>>(&self, file: P) -> Result<(), Error> {
        let file = file.as_ref();
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(file, self.document.to_string())
            .context(format!("Writing configuration {}", file.display()))
    }

    fn into_configuration(self) -> Result<Configuration, Error> {
        Ok(toml_edit::de::from_document(self.document)?)
    }

    fn replace(&mut self, config: &Configuration) -> Result<(), Error> {
        // to_document produces inline tables everywhere, going through a pretty string keeps the file readable
        let pretty = toml_edit::ser::to_string_pretty(config)?;
        self.document = DocumentMut::from_str(&pretty)?;
        Ok(())
    }
}

impl ConfigBackend for TomlConfiguration {
    fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, Error> {
        Self::read(file)?.into_configuration()
    }

    fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), Error> {
        let mut toml = Self::default();
        toml.replace(config)?;
        toml.write(file)
    }
}
