//! Operation codes exchanged between nodes and clients

use serde::{Deserialize, Serialize};

macro_rules! query_types {
    ($($variant:ident => $code:literal),+ $(,)?) => {
        /// The fixed command vocabulary. Each variant maps to one wire code.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum QueryType {
            $(
                #[serde(rename = $code)]
                $variant,
            )+
        }

        impl QueryType {
            pub const ALL: &'static [QueryType] = &[$(QueryType::$variant),+];

            /// Wire code for this operation.
            pub fn code(&self) -> &'static str {
                match self {
                    $(QueryType::$variant => $code,)+
                }
            }
        }
    };
}

query_types! {
    BulkSelect => "BULK-SELECT",
    Contains => "CONTAINS",
    Delete => "DELETE",
    Insert => "INSERT",
    Save => "SAVE",
    Select => "SELECT",
    SelectAll => "SELECT-ALL",
    Update => "UPDATE",

    CreateTable => "CREATE-TABLE",
    CreateCollection => "CREATE-COLLECTION",
    DropCollection => "DROP-COLLECTION",
    DropTable => "DROP-TABLE",
    ListSchema => "LIST-COLS",
    ListCollections => "LIST-COLLECTIONS",
    ListTables => "LIST-TABLES",
    RenameCollection => "RENAME-COLLECTION",
    RenameTable => "RENAME-TABLE",
    CollectionExists => "COLLECTION-EXISTS",
    TableExists => "TABLE-EXISTS",
    TruncateCollection => "TRUNCATE-COLLECTION",
    TruncateTable => "TRUNCATE-TABLE",

    AddColumn => "ADD-COLUMN",
    AlterColumn => "ALTER-COLUMN",
    ChangeDataType => "CHANGE-DATA-TYPE",
    DropColumn => "DROP-COLUMN",
    DropIndex => "DROP-INDEX",
    DropUnique => "DROP-UNIQUE",
    Index => "INDEX",
    RenameColumn => "RENAME-COLUMN",

    Search => "SEARCH",
    SearchAnd => "SEARCH-AND",
    SearchAndLoad => "SEARCH-AND-LOAD",
    SearchOr => "SEARCH-OR",
    SearchOrLoad => "SEARCH-OR-LOAD",
    SearchFiltered => "SEARCH-FILTERED",
    InsertCustom => "INSERT-CUSTOM",

    Sql => "SQL",

    CreateDb => "CREATE-DB",
    CreateDs => "CREATE-DS",
    DropDb => "DROP-DB",
    DropDs => "DROP-DS",
    ListDs => "LIST-DS",
    TruncateDs => "TRUNCATE-DS",
    DsExists => "DS-EXISTS",

    ApplyLicense => "APPLY-LICENSE",
    LicenseStatus => "LICENSE-STATUS",
    RevokeLicense => "REVOKE-LICENSE",

    BulkExport => "BULK-EXPORT",
    BulkImport => "BULK-IMPORT",
    ListOps => "LIST-OPS",
    ResetUsage => "RESET-USAGE",
    SetLimits => "SET-LIMITS",
    Usage => "USAGE",

    ChangeTrigger => "CHANGE-TRIGGER",
    ListFilters => "LIST-FILTERS",
    ListTriggers => "LIST-TRIGGERS",
    LoadCode => "LOAD-CODE",
    RegisterProcedure => "REGISTER-PROCEDURE",
    RegisterTrigger => "REGISTER-TRIGGER",
    UnregisterProcedure => "UNREGISTER-PROCEDURE",
    UnregisterTrigger => "UNREGISTER-TRIGGER",
    Sp => "SP",

    AddUser => "ADD-USER",
    ChangePassword => "CHANGE-PASSWORD",
    DropUser => "DROP-USER",
    VerifyCredentials => "VERIFY-CREDENTIALS",

    CreateGroup => "CREATE-GROUP",
    DropGroup => "DROP-GROUP",
    AddToGroup => "ADD-TO-GROUP",
    RemoveFromGroup => "REMOVE-FROM-GROUP",

    NodeId => "NODE-ID",
    AddNode => "ADD-NODE",
    ListNodes => "LIST-NODES",
    DropNode => "DROP-NODE",

    Onb1 => "ONB1",
    Onb1Ack => "ONB1_ACK",
    Onb2 => "ONB2",
    Onb2Ack => "ONB2_ACK",
    Onb3 => "ONB3",
    Onb3Ack => "ONB3_ACK",
    Onb4 => "ONB4",
    Onb4Ack => "ONB4_ACK",
    Onb51 => "ONB5_1",
    Onb52 => "ONB5_2",
    Onb51Ack => "ONB5_1_ACK",
    Onb52Ack => "ONB5_2_ACK",
    OnbSuccess => "ONB_SUCCESS",

    Rollback => "R",
    Commit => "C",
    SoftCommitSuccess => "SCS",
    CommitSuccess => "CS",
    RollbackSuccess => "RS",
    QueryResponse => "QR",
    Ping => "PING",
    MemFlush => "MEM-FLUSH",
}

impl QueryType {
    /// Case-insensitive lookup of a wire code.
    pub fn from_code(code: &str) -> Option<QueryType> {
        QueryType::ALL
            .iter()
            .copied()
            .find(|t| t.code().eq_ignore_ascii_case(code))
    }

    /// Part of the onboarding handshake (ONB*).
    pub fn is_onboarding(&self) -> bool {
        self.code().starts_with("ONB")
    }

    /// Acknowledgement flowing from a participant back to the master.
    pub fn is_master_ack(&self) -> bool {
        matches!(
            self,
            QueryType::CommitSuccess
                | QueryType::SoftCommitSuccess
                | QueryType::RollbackSuccess
                | QueryType::QueryResponse
        )
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code_is_case_insensitive() {
        assert_eq!(QueryType::from_code("create-ds"), Some(QueryType::CreateDs));
        assert_eq!(QueryType::from_code("onb5_2_ack"), Some(QueryType::Onb52Ack));
        assert_eq!(QueryType::from_code("c"), Some(QueryType::Commit));
        assert_eq!(QueryType::from_code("nope"), None);
    }

    #[test]
    fn test_codes_are_unique() {
        let mut codes: Vec<&str> = QueryType::ALL.iter().map(|t| t.code()).collect();
        let total = codes.len();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), total);
    }

    #[test]
    fn test_classification() {
        assert!(QueryType::Onb1.is_onboarding());
        assert!(QueryType::OnbSuccess.is_onboarding());
        assert!(!QueryType::Commit.is_onboarding());
        assert!(QueryType::SoftCommitSuccess.is_master_ack());
        assert!(!QueryType::Rollback.is_master_ack());
    }
}
