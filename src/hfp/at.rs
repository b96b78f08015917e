//! AT command string utilities.
//!
//! This module contains the pure text-processing half of the AT
//! processor: normalization of raw command strings, quote-aware
//! argument splitting, vendor command classification and HF-indicator
//! id-list parsing. Anything that touches state lives on the machine.

use core::fmt;

use smallvec::SmallVec;
use smol_str::SmolStr;
use thiserror::Error;

/// Error type for AT command parsing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AtError {
   /// The command has no `=` or carries a read/test marker where only
   /// SET is accepted.
   #[error("Malformed AT command: {command}")]
   MalformedCommand { command: SmolStr },

   /// The command mnemonic is not in the vendor table.
   #[error("Unsupported vendor command: {command}")]
   UnsupportedCommand { command: SmolStr },
}

/// Classification of an AT command after the mnemonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtCommandType {
   Read,
   Test,
   Set,
   Unknown,
}

/// One parsed AT argument. Malformed integers stay opaque text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtArg {
   Int(i64),
   Text(SmolStr),
}

impl fmt::Display for AtArg {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Int(v) => write!(f, "{v}"),
         Self::Text(s) => f.write_str(s),
      }
   }
}

pub type AtArgs = SmallVec<[AtArg; 4]>;

/// A vendor-specific SET command with its assigned company id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorCommand {
   pub command: SmolStr,
   pub company_id: u16,
   pub args: AtArgs,
}

// Bluetooth SIG assigned company identifiers.
pub const COMPANY_ID_PLANTRONICS: u16 = 85;
pub const COMPANY_ID_APPLE: u16 = 76;
pub const COMPANY_ID_GOOGLE: u16 = 224;

/// Vendor AT commands we recognize, keyed by mnemonic.
const VENDOR_COMPANY_IDS: &[(&str, u16)] = &[
   ("+XEVENT", COMPANY_ID_PLANTRONICS),
   ("+XAPL", COMPANY_ID_APPLE),
   ("+IPHONEACCEV", COMPANY_ID_APPLE),
   ("+ANDROID", COMPANY_ID_GOOGLE),
];

// HF indicator ids from the Hands-Free 1.7 assigned numbers.
pub const HF_INDICATOR_ENHANCED_DRIVER_SAFETY: u16 = 1;
pub const HF_INDICATOR_BATTERY_LEVEL: u16 = 2;

/// Normalizes a raw AT string: spaces are dropped and letters
/// uppercased outside quotes, quoted substrings pass through verbatim,
/// and an unmatched trailing quote is closed.
pub fn normalize(raw: &str) -> String {
   let mut out = String::with_capacity(raw.len());
   let bytes = raw.as_bytes();
   let mut i = 0;
   while i < bytes.len() {
      let c = bytes[i] as char;
      if c == '"' {
         match raw[i + 1..].find('"') {
            None => {
               // unmatched quote, take the rest and close it
               out.push_str(&raw[i..]);
               out.push('"');
               break;
            },
            Some(j) => {
               let end = i + 1 + j;
               out.push_str(&raw[i..=end]);
               i = end;
            },
         }
      } else if c != ' ' {
         out.push(c.to_ascii_uppercase());
      }
      i += 1;
   }
   out
}

/// Classifies a normalized command by the marker after its 5-character
/// mnemonic (`+XXXX?`, `+XXXX=?`, `+XXXX=`).
pub fn command_type(command: &str) -> AtCommandType {
   let command = command.trim();
   if command.len() <= 5 {
      return AtCommandType::Unknown;
   }
   let rest = &command[5..];
   if rest.starts_with("=?") {
      AtCommandType::Test
   } else if rest.starts_with('?') {
      AtCommandType::Read
   } else if rest.starts_with('=') {
      AtCommandType::Set
   } else {
      AtCommandType::Unknown
   }
}

/// Finds `ch` in `input` starting at `from`, ignoring quoted sections.
/// Returns `input.len()` if not found.
fn find_unquoted(input: &str, ch: char, from: usize) -> usize {
   let bytes = input.as_bytes();
   let mut i = from;
   while i < bytes.len() {
      let c = bytes[i] as char;
      if c == '"' {
         match input[i + 1..].find('"') {
            None => return input.len(),
            Some(j) => i += 1 + j,
         }
      } else if c == ch {
         return i;
      }
      i += 1;
   }
   input.len()
}

/// Breaks an argument string into comma-delimited arguments. Commas
/// inside quotes are not delimiters; arguments that parse as integers
/// become [`AtArg::Int`], everything else stays text.
pub fn split_args(input: &str) -> AtArgs {
   let mut out = AtArgs::new();
   let mut i = 0;
   while i <= input.len() {
      let j = find_unquoted(input, ',', i);
      let arg = &input[i..j];
      match arg.parse::<i64>() {
         Ok(v) => out.push(AtArg::Int(v)),
         Err(_) => out.push(AtArg::Text(arg.into())),
      }
      i = j + 1; // move past comma
   }
   out
}

/// Parses a normalized vendor SET command (`+CMD=args`).
pub fn parse_vendor_command(command: &str) -> Result<VendorCommand, AtError> {
   let Some(eq) = command.find('=') else {
      return Err(AtError::MalformedCommand {
         command: command.into(),
      });
   };

   let mnemonic = &command[..eq];
   let Some(&(_, company_id)) = VENDOR_COMPANY_IDS.iter().find(|(cmd, _)| *cmd == mnemonic)
   else {
      return Err(AtError::UnsupportedCommand {
         command: command.into(),
      });
   };

   let arg = &command[eq + 1..];
   if arg.starts_with('?') {
      // only SET is accepted for vendor commands
      return Err(AtError::MalformedCommand {
         command: command.into(),
      });
   }

   Ok(VendorCommand {
      command: mnemonic.into(),
      company_id,
      args: split_args(arg),
   })
}

/// Parses the comma-delimited indicator id list of `AT+BIND=`.
/// Malformed entries are skipped.
pub fn parse_indicator_ids(list: &str) -> SmallVec<[u16; 4]> {
   let mut ids = SmallVec::new();
   let mut i = 0;
   while i < list.len() {
      let j = find_unquoted(list, ',', i);
      if let Ok(id) = list[i..j].trim().parse::<u16>() {
         ids.push(id);
      }
      i = j + 1;
   }
   ids
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn normalize_uppercases_and_strips_spaces() {
      assert_eq!(normalize("+xapl = 1, 2"), "+XAPL=1,2");
   }

   #[test]
   fn normalize_preserves_quoted_sections() {
      assert_eq!(normalize("+test=\"Ab c\",x"), "+TEST=\"Ab c\",X");
   }

   #[test]
   fn normalize_closes_unmatched_quote() {
      assert_eq!(normalize("+test=\"abc"), "+TEST=\"abc\"");
   }

   #[test]
   fn command_types() {
      assert_eq!(command_type("+CPBR=?"), AtCommandType::Test);
      assert_eq!(command_type("+CPBR?"), AtCommandType::Read);
      assert_eq!(command_type("+CPBR=1,2"), AtCommandType::Set);
      assert_eq!(command_type("+CPBR"), AtCommandType::Unknown);
   }

   #[test]
   fn split_args_handles_quoted_commas() {
      let args = split_args("1,\"a,b\",3");
      assert_eq!(args.len(), 3);
      assert_eq!(args[0], AtArg::Int(1));
      assert_eq!(args[1], AtArg::Text("\"a,b\"".into()));
      assert_eq!(args[2], AtArg::Int(3));
   }

   #[test]
   fn split_args_keeps_malformed_integers_as_text() {
      let args = split_args("12x,7");
      assert_eq!(args[0], AtArg::Text("12x".into()));
      assert_eq!(args[1], AtArg::Int(7));
   }

   #[test]
   fn split_args_of_empty_input_is_one_empty_text() {
      let args = split_args("");
      assert_eq!(args.len(), 1);
      assert_eq!(args[0], AtArg::Text("".into()));
   }

   #[test]
   fn vendor_lookup() {
      let cmd = parse_vendor_command("+XAPL=ABCD-1234-0100,2").expect("vendor");
      assert_eq!(cmd.company_id, COMPANY_ID_APPLE);
      assert_eq!(cmd.command, "+XAPL");
      assert_eq!(cmd.args.len(), 2);

      assert_eq!(
         parse_vendor_command("+NOPE=1"),
         Err(AtError::UnsupportedCommand {
            command: "+NOPE=1".into()
         })
      );
      assert_eq!(
         parse_vendor_command("+XAPL"),
         Err(AtError::MalformedCommand {
            command: "+XAPL".into()
         })
      );
      assert_eq!(
         parse_vendor_command("+XAPL=?"),
         Err(AtError::MalformedCommand {
            command: "+XAPL=?".into()
         })
      );
   }

   #[test]
   fn indicator_id_list() {
      assert_eq!(parse_indicator_ids("1,2").as_slice(), &[1, 2]);
      assert_eq!(parse_indicator_ids("2,bogus,1").as_slice(), &[2, 1]);
      assert!(parse_indicator_ids("").is_empty());
   }
}
