//! Macro identifiers usable in a [`crate::template`] template, and the
//! name-to-id lookup table compiled templates use. Kept as a flat,
//! finite enum per the translation strategy: a tagged variant set stands
//! in for the donor's macro-id integers plus a runtime name table.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateField {
    Date,
    FullDate,
    IsoDate,
    Stamp,
    Year,
    Month,
    Day,
    Hour,
    Min,
    Sec,
    Weekday,
    Week,
    TzOffset,
    Tz,
    UnixTime,
    MonthName,
    MonthAbbrev,
    WeekdayName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFamily {
    /// Whichever of stamp/received the parser decided on (matches
    /// `keep_timestamp` resolution in LogSource).
    Default,
    Received,
    Stamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroId {
    Facility,
    FacilityNum,
    Level,
    LevelNum,
    Tag,
    Tags,
    BsdTag,
    Pri,
    Date(DateFamily, DateField),
    FullHost,
    Host,
    FullHostFrom,
    HostFrom,
    Program,
    Pid,
    Message,
    MsgOnly,
    SourceIp,
    Sdata,
    MsgHdr,
    SeqNum,
}

/// Parses a bare macro name (no leading `$`, no braces) into its id. Family
/// prefixes `R_`/`S_` select the received/stamp timestamp family; a bare
/// date-field name is the default family.
pub fn lookup(name: &str) -> Option<MacroId> {
    let (family, rest) = if let Some(r) = name.strip_prefix("R_") {
        (DateFamily::Received, r)
    } else if let Some(r) = name.strip_prefix("S_") {
        (DateFamily::Stamp, r)
    } else {
        (DateFamily::Default, name)
    };

    if let Some(field) = lookup_date_field(rest) {
        return Some(MacroId::Date(family, field));
    }

    if family != DateFamily::Default {
        return None;
    }

    Some(match name {
        "FACILITY" => MacroId::Facility,
        "FACILITY_NUM" => MacroId::FacilityNum,
        "LEVEL" | "PRIORITY" => MacroId::Level,
        "LEVEL_NUM" => MacroId::LevelNum,
        "TAG" => MacroId::Tag,
        "TAGS" => MacroId::Tags,
        "BSDTAG" => MacroId::BsdTag,
        "PRI" => MacroId::Pri,
        "FULLHOST" => MacroId::FullHost,
        "HOST" => MacroId::Host,
        "FULLHOST_FROM" => MacroId::FullHostFrom,
        "HOST_FROM" => MacroId::HostFrom,
        "PROGRAM" => MacroId::Program,
        "PID" => MacroId::Pid,
        "MSGID" | "MESSAGE" => MacroId::Message,
        "MSGONLY" => MacroId::MsgOnly,
        "SOURCEIP" => MacroId::SourceIp,
        "SDATA" => MacroId::Sdata,
        "MSGHDR" => MacroId::MsgHdr,
        "SEQNUM" => MacroId::SeqNum,
        _ => return None,
    })
}

fn lookup_date_field(name: &str) -> Option<DateField> {
    Some(match name {
        "DATE" => DateField::Date,
        "FULLDATE" => DateField::FullDate,
        "ISODATE" => DateField::IsoDate,
        "STAMP" => DateField::Stamp,
        "YEAR" => DateField::Year,
        "MONTH" => DateField::Month,
        "DAY" => DateField::Day,
        "HOUR" => DateField::Hour,
        "MIN" => DateField::Min,
        "SEC" => DateField::Sec,
        "WEEKDAY" => DateField::Weekday,
        "WEEK" => DateField::Week,
        "TZOFFSET" => DateField::TzOffset,
        "TZ" => DateField::Tz,
        "UNIXTIME" => DateField::UnixTime,
        "MONTH_NAME" => DateField::MonthName,
        "MONTH_ABBREV" => DateField::MonthAbbrev,
        "WEEK_DAY_NAME" => DateField::WeekdayName,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_family_date_field() {
        assert_eq!(lookup("ISODATE"), Some(MacroId::Date(DateFamily::Default, DateField::IsoDate)));
    }

    #[test]
    fn received_family_prefix() {
        assert_eq!(lookup("R_UNIXTIME"), Some(MacroId::Date(DateFamily::Received, DateField::UnixTime)));
    }

    #[test]
    fn stamp_family_prefix() {
        assert_eq!(lookup("S_YEAR"), Some(MacroId::Date(DateFamily::Stamp, DateField::Year)));
    }

    #[test]
    fn non_date_macro() {
        assert_eq!(lookup("PROGRAM"), Some(MacroId::Program));
        assert_eq!(lookup("NOT_A_MACRO"), None);
    }
}
