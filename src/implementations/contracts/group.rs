use ethers_contract::abigen;

// Struct-typed returns decode as tuples in field order.
abigen!(
    GroupChat,
    r#"[
        struct GroupMessage { address sender; uint256 timestamp; string content; }
        struct GroupMember { address account; uint8 role; uint256 joined; }
        event GroupCreated(uint256 indexed groupId, address indexed owner, string name)
        function createGroup(string name, string description, bool isPrivate) returns (uint256)
        function getUserGroups(address account) view returns (uint256[])
        function getGroup(uint256 groupId) view returns (string name, string description, address owner, uint256 createdAt, bool isPrivate, uint256 memberCount)
        function joinGroup(uint256 groupId)
        function sendMessage(uint256 groupId, string content)
        function getGroupMessages(uint256 groupId) view returns (GroupMessage[])
        function getGroupMember(uint256 groupId, address account) view returns (GroupMember)
        function addMember(uint256 groupId, address account, uint8 role)
        function updateMemberRole(uint256 groupId, address account, uint8 role)
        function rejectJoinRequest(uint256 groupId, address requester)
        function getPendingJoinRequests(uint256 groupId) view returns (address[])
    ]"#
);
