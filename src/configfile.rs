// klippy_mcu/src/configfile.rs
// Reads the printer configuration (INI style sections and options).

use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    SectionNotFound(String),
    OptionNotFound(String, String),
    ParseError(String, String, String), // option, value, type_expected
    ValidationError(String),            // General validation like min/max
    Syntax(String),
    Io(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::SectionNotFound(s) => write!(f, "Section not found: [{}]", s),
            ConfigError::OptionNotFound(s, o) => write!(f, "Option '{}' not found in section '[{}]'", o, s),
            ConfigError::ParseError(o, v, t) => write!(f, "Failed to parse option '{}' value '{}' as {}", o, v, t),
            ConfigError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            ConfigError::Syntax(msg) => write!(f, "Config syntax error: {}", msg),
            ConfigError::Io(msg) => write!(f, "Unable to read config file: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Default, Clone)]
pub struct Configfile {
    // section_name -> { option_name -> option_value }
    // Section and option names are stored as lowercase.
    data: HashMap<String, HashMap<String, String>>,
    // Section names in file order
    order: Vec<String>,
    filename: Option<String>,
}

impl Configfile {
    pub fn new(filename: Option<String>) -> Self {
        Configfile { data: HashMap::new(), order: Vec::new(), filename }
    }

    pub fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let mut config = Configfile::new(Some(path.display().to_string()));
        config.parse(&content)?;
        Ok(config)
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Parses an INI-style configuration string.
    pub fn parse(&mut self, config_content: &str) -> Result<(), ConfigError> {
        self.data.clear();
        self.order.clear();
        let mut current_section_name: Option<String> = None;

        for line_raw in config_content.lines() {
            // Strip comments (everything after '#' or ';')
            let line_no_comment = match line_raw.find(['#', ';']) {
                Some(index) => &line_raw[..index],
                None => line_raw,
            };
            let line = line_no_comment.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let section_name = line[1..line.len() - 1]
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
                    .to_lowercase();
                if section_name.is_empty() {
                    return Err(ConfigError::Syntax("Empty section name found".to_string()));
                }
                if !self.data.contains_key(&section_name) {
                    self.order.push(section_name.clone());
                }
                self.data.entry(section_name.clone()).or_default();
                current_section_name = Some(section_name);
                continue;
            }

            let Some(section_name) = current_section_name.as_ref() else {
                return Err(ConfigError::Syntax(format!("Line outside of section: {}", line_raw)));
            };
            // Support both "key = value" and "key: value"
            let split = match (line.find('='), line.find(':')) {
                (Some(eq), Some(colon)) => Some(eq.min(colon)),
                (Some(eq), None) => Some(eq),
                (None, Some(colon)) => Some(colon),
                (None, None) => None,
            };
            let Some(pos) = split else {
                return Err(ConfigError::Syntax(format!(
                    "Malformed line in section [{}]: {}",
                    section_name, line_raw
                )));
            };
            let key = line[..pos].trim().to_lowercase();
            let value = line[pos + 1..].trim().to_string();
            if key.is_empty() {
                return Err(ConfigError::Syntax(format!("Empty key found in section [{}]", section_name)));
            }
            self.data.entry(section_name.clone()).or_default().insert(key, value);
        }
        Ok(())
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.data.contains_key(&section.to_lowercase())
    }

    /// Section names in file order.
    pub fn sections(&self) -> &[String] {
        &self.order
    }

    /// All sections starting with `prefix`, in file order.
    pub fn get_prefix_sections(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.to_lowercase();
        self.order.iter().filter(|s| s.starts_with(&prefix)).cloned().collect()
    }

    pub fn get_str(&self, section: &str, option: &str) -> Result<&String, ConfigError> {
        self.data
            .get(&section.to_lowercase())
            .ok_or_else(|| ConfigError::SectionNotFound(section.to_string()))?
            .get(&option.to_lowercase())
            .ok_or_else(|| ConfigError::OptionNotFound(section.to_string(), option.to_string()))
    }

    // Raw value, or the default when only the option is missing.
    fn get_raw(&self, section: &str, option: &str) -> Result<Option<&String>, ConfigError> {
        match self.get_str(section, option) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigError::OptionNotFound(_, _)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, section: &str, option: &str, default: Option<&str>) -> Result<String, ConfigError> {
        match (self.get_raw(section, option)?, default) {
            (Some(value), _) => Ok(value.clone()),
            (None, Some(d)) => Ok(d.to_string()),
            (None, None) => Err(ConfigError::OptionNotFound(section.to_string(), option.to_string())),
        }
    }

    pub fn getfloat(
        &self,
        section: &str,
        option: &str,
        default: Option<f64>,
        minval: Option<f64>,
        maxval: Option<f64>,
    ) -> Result<f64, ConfigError> {
        let parsed_val = match (self.get_raw(section, option)?, default) {
            (Some(s_val), _) => s_val
                .parse::<f64>()
                .map_err(|_| ConfigError::ParseError(option.to_string(), s_val.clone(), "float".to_string()))?,
            (None, Some(d)) => return Ok(d),
            (None, None) => return Err(ConfigError::OptionNotFound(section.to_string(), option.to_string())),
        };
        if let Some(min) = minval {
            if parsed_val < min {
                return Err(ConfigError::ValidationError(format!(
                    "Option '{}' in section '[{}]' ({}) must be >= {}",
                    option, section, parsed_val, min
                )));
            }
        }
        if let Some(max) = maxval {
            if parsed_val > max {
                return Err(ConfigError::ValidationError(format!(
                    "Option '{}' in section '[{}]' ({}) must be <= {}",
                    option, section, parsed_val, max
                )));
            }
        }
        Ok(parsed_val)
    }

    pub fn getint(
        &self,
        section: &str,
        option: &str,
        default: Option<i64>,
        minval: Option<i64>,
        maxval: Option<i64>,
    ) -> Result<i64, ConfigError> {
        let parsed_val = match (self.get_raw(section, option)?, default) {
            (Some(s_val), _) => s_val
                .parse::<i64>()
                .map_err(|_| ConfigError::ParseError(option.to_string(), s_val.clone(), "integer".to_string()))?,
            (None, Some(d)) => return Ok(d),
            (None, None) => return Err(ConfigError::OptionNotFound(section.to_string(), option.to_string())),
        };
        if let Some(min) = minval {
            if parsed_val < min {
                return Err(ConfigError::ValidationError(format!(
                    "Option '{}' in section '[{}]' ({}) must be >= {}",
                    option, section, parsed_val, min
                )));
            }
        }
        if let Some(max) = maxval {
            if parsed_val > max {
                return Err(ConfigError::ValidationError(format!(
                    "Option '{}' in section '[{}]' ({}) must be <= {}",
                    option, section, parsed_val, max
                )));
            }
        }
        Ok(parsed_val)
    }

    pub fn getboolean(&self, section: &str, option: &str, default: Option<bool>) -> Result<bool, ConfigError> {
        match (self.get_raw(section, option)?, default) {
            (Some(s_val), _) => match s_val.to_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(ConfigError::ParseError(option.to_string(), s_val.clone(), "boolean".to_string())),
            },
            (None, Some(d)) => Ok(d),
            (None, None) => Err(ConfigError::OptionNotFound(section.to_string(), option.to_string())),
        }
    }

    /// Value restricted to one of `choices`.
    pub fn getchoice(
        &self,
        section: &str,
        option: &str,
        choices: &[&str],
        default: Option<&str>,
    ) -> Result<String, ConfigError> {
        let value = self.get(section, option, default)?;
        if !choices.contains(&value.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Choice '{}' for option '{}' in section '[{}]' is not a valid choice",
                value, option, section
            )));
        }
        Ok(value)
    }

    pub fn add_section(&mut self, section_name: &str) {
        let section = section_name.to_lowercase();
        if !self.data.contains_key(&section) {
            self.order.push(section.clone());
        }
        self.data.entry(section).or_default();
    }

    pub fn set(&mut self, section: &str, option: &str, value: &str) {
        self.add_section(section);
        self.data
            .entry(section.to_lowercase())
            .or_default()
            .insert(option.to_lowercase(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_parsed_config(content: &str) -> Configfile {
        let mut cf = Configfile::new(None);
        cf.parse(content).unwrap();
        cf
    }

    #[test]
    fn test_parse_simple_config() {
        let content = "[mcu]\nserial = /dev/ttyACM0\nbaud:250000\n\n[mcu  aux]\nrestart_method=command";
        let cf = create_parsed_config(content);

        assert_eq!(cf.get("mcu", "serial", None).unwrap(), "/dev/ttyACM0");
        assert_eq!(cf.get("mcu", "BAUD", None).unwrap(), "250000");
        assert_eq!(cf.get("MCU aux", "restart_method", None).unwrap(), "command");
        assert_eq!(cf.sections(), &["mcu".to_string(), "mcu aux".to_string()]);
    }

    #[test]
    fn test_parse_with_comments_and_whitespace() {
        let content = r#"
# This is a full line comment
[mcu] ; another comment style
  serial = /dev/serial/by-id/usb-Klipper_stm32 # trailing comment
  restart_method:    command
  ; baud = 115200
[mcu aux]
baud = 250000
"#;
        let cf = create_parsed_config(content);
        assert_eq!(cf.get("mcu", "serial", None).unwrap(), "/dev/serial/by-id/usb-Klipper_stm32");
        assert_eq!(cf.get("mcu", "restart_method", None).unwrap(), "command");
        assert!(cf.get("mcu", "baud", None).is_err());
        assert_eq!(cf.getint("mcu aux", "baud", None, None, None).unwrap(), 250000);
    }

    #[test]
    fn test_getters_with_types_and_defaults() {
        let content = "[types]\nmyfloat = 3.14\nmyint = 42\nmybool_true = true\nmybool_false = No";
        let cf = create_parsed_config(content);

        assert_eq!(cf.getfloat("types", "myfloat", None, None, None).unwrap(), 3.14);
        assert_eq!(cf.getint("types", "myint", None, None, None).unwrap(), 42);
        assert!(cf.getboolean("types", "mybool_true", None).unwrap());
        assert!(!cf.getboolean("types", "mybool_false", None).unwrap());

        assert_eq!(cf.get("types", "nonexistent", Some("default_val")).unwrap(), "default_val");
        assert_eq!(cf.getfloat("types", "nonexistent_float", Some(1.23), None, None).unwrap(), 1.23);
        assert_eq!(cf.getint("types", "nonexistent_int", Some(100), None, None).unwrap(), 100);
        assert!(cf.getboolean("types", "nonexistent_bool", Some(true)).unwrap());

        assert!(cf.get("types", "required_missing", None).is_err());
        assert!(cf.getfloat("types", "required_float_missing", None, None, None).is_err());
        assert!(matches!(
            cf.get("nosection", "x", Some("d")),
            Err(ConfigError::SectionNotFound(_))
        ));
    }

    #[test]
    fn test_getfloat_with_validation() {
        let cf = create_parsed_config("[validation]\nval = 10.0");
        assert_eq!(cf.getfloat("validation", "val", None, Some(0.0), Some(20.0)).unwrap(), 10.0);

        match cf.getfloat("validation", "val", None, Some(15.0), Some(20.0)) {
            Err(ConfigError::ValidationError(msg)) => assert!(msg.contains("must be >= 15")),
            other => panic!("Expected ValidationError for minval, got {:?}", other),
        }
        match cf.getfloat("validation", "val", None, Some(0.0), Some(5.0)) {
            Err(ConfigError::ValidationError(msg)) => assert!(msg.contains("must be <= 5")),
            other => panic!("Expected ValidationError for maxval, got {:?}", other),
        }
    }

    #[test]
    fn test_getchoice() {
        let cf = create_parsed_config("[mcu]\nrestart_method = cheetah\n[mcu aux]\nrestart_method = bogus");
        let choices = ["none", "arduino", "cheetah", "command", "rpi_usb"];
        assert_eq!(cf.getchoice("mcu", "restart_method", &choices, None).unwrap(), "cheetah");
        assert!(cf.getchoice("mcu aux", "restart_method", &choices, None).is_err());
        cf.getchoice("mcu", "missing", &choices, Some("none")).unwrap();
    }

    #[test]
    fn test_prefix_sections() {
        let cf = create_parsed_config("[mcu]\n[mcu zboard]\n[printer]\n[mcu aux]\n");
        assert_eq!(cf.get_prefix_sections("mcu "), vec!["mcu zboard".to_string(), "mcu aux".to_string()]);
        assert!(cf.has_section("Printer"));
        assert!(!cf.has_section("extruder"));
    }

    #[test]
    fn test_parse_errors() {
        let mut cf = Configfile::new(None);
        assert!(matches!(cf.parse("[]\nkey=val"), Err(ConfigError::Syntax(_))));
        assert!(cf.parse("[sec]\n=val").is_err());
        assert!(cf.parse("[sec]\njustavalue").is_err());
        assert!(cf.parse("key=val").is_err());
    }

    #[test]
    fn test_parse_various_bool_strings() {
        let content = "[bools]\nt1=True\nt2=yes\nt3=ON\nt4=1\nf1=False\nf2=NO\nf3=off\nf4=0";
        let cf = create_parsed_config(content);
        for opt in ["t1", "t2", "t3", "t4"] {
            assert!(cf.getboolean("bools", opt, None).unwrap());
        }
        for opt in ["f1", "f2", "f3", "f4"] {
            assert!(!cf.getboolean("bools", opt, None).unwrap());
        }
        let cf = create_parsed_config("[bools]\nmaybe = perhaps");
        assert!(matches!(cf.getboolean("bools", "maybe", None), Err(ConfigError::ParseError(..))));
    }
}
